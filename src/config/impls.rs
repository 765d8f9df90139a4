use super::structs::CommandMode;
use crate::error::Error;

use serde::Deserialize;
use std::{
    fmt::{self, Display},
    str::FromStr,
};

impl FromStr for CommandMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "shell" => Ok(CommandMode::Shell),
            "run" => Ok(CommandMode::Run),
            "exec" => Ok(CommandMode::Exec),
            _ => Err(Error::UnknownCommand(s.to_string())),
        }
    }
}

impl Display for CommandMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandMode::Shell => write!(f, "shell"),
            CommandMode::Run => write!(f, "run"),
            CommandMode::Exec => write!(f, "exec"),
        }
    }
}

pub(crate) fn deserialize_level_filter<'de, D>(
    deserializer: D,
) -> Result<Option<log::LevelFilter>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(deserializer)?;
    s.map_or(Ok(None), |s| {
        log::LevelFilter::from_str(&s)
            .map(Some)
            .map_err(serde::de::Error::custom)
    })
}
