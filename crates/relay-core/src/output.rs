use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Notification verbosity for message updates.
///
/// Approval and task-completion notices fire at every level; the level only
/// decides whether new agent messages are pushed as well.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLevel {
    /// Approvals and completions only.
    Silence,
    /// Plain agent text, no tool traffic.
    Simple,
    /// Every non-user message with a preview.
    #[default]
    Detail,
}

impl OutputLevel {
    pub const ALL: [OutputLevel; 3] = [Self::Silence, Self::Simple, Self::Detail];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Silence => "silence",
            Self::Simple => "simple",
            Self::Detail => "detail",
        }
    }

    pub fn pushes_messages(&self) -> bool {
        !matches!(self, Self::Silence)
    }
}

impl fmt::Display for OutputLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputLevel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "silence" | "silent" => Ok(Self::Silence),
            "simple" => Ok(Self::Simple),
            "detail" => Ok(Self::Detail),
            other => Err(format!("unknown output level: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_levels() {
        assert_eq!("silence".parse::<OutputLevel>().unwrap(), OutputLevel::Silence);
        assert_eq!("SIMPLE".parse::<OutputLevel>().unwrap(), OutputLevel::Simple);
        assert_eq!(" detail ".parse::<OutputLevel>().unwrap(), OutputLevel::Detail);
        assert!("summary".parse::<OutputLevel>().is_err());
    }

    #[test]
    fn display_round_trips_through_from_str() {
        for level in OutputLevel::ALL {
            assert_eq!(level.to_string().parse::<OutputLevel>().unwrap(), level);
        }
    }

    #[test]
    fn only_silence_mutes_messages() {
        assert!(!OutputLevel::Silence.pushes_messages());
        assert!(OutputLevel::Simple.pushes_messages());
        assert!(OutputLevel::Detail.pushes_messages());
    }

    #[test]
    fn serde_lowercase() {
        assert_eq!(serde_json::to_string(&OutputLevel::Simple).unwrap(), "\"simple\"");
        let level: OutputLevel = serde_json::from_str("\"silence\"").unwrap();
        assert_eq!(level, OutputLevel::Silence);
    }
}
