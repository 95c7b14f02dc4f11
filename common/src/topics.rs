pub const TOPIC_TELE_POWER: &str = "pilotwire/tele/power";
pub const TOPIC_TELE_TEMPERATURE: &str = "pilotwire/tele/temperature";

pub const TOPIC_STAT_STATE: &str = "pilotwire/stat/state";
pub const TOPIC_STAT_STATUS: &str = "pilotwire/stat/status";

pub const TOPIC_CMD_MODE: &str = "pilotwire/cmnd/mode";
pub const TOPIC_CMD_POWER: &str = "pilotwire/cmnd/power";
pub const TOPIC_CMD_OUTSIDE: &str = "pilotwire/cmnd/outside";
pub const TOPIC_CMD_TARGET: &str = "pilotwire/cmnd/target";
