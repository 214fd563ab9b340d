//! Pipeline stages.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Route,
    Understand,
    Plan,
    Execute,
    Reply,
    Summarize,
    /// Raw streamed completions in a bypass mode
    Bypass,
    /// Leaving a bypass mode
    Handoff,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Route,
        Stage::Understand,
        Stage::Plan,
        Stage::Execute,
        Stage::Reply,
        Stage::Summarize,
        Stage::Bypass,
        Stage::Handoff,
    ];

    /// Recover the stage from a system prompt's first line.
    pub fn from_header(system_prompt: &str) -> Option<Stage> {
        let name = system_prompt.lines().next()?.strip_prefix("## Stage: ")?;
        Self::ALL.into_iter().find(|s| s.as_str() == name.trim())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Route => "route",
            Self::Understand => "understand",
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Reply => "reply",
            Self::Summarize => "summarize",
            Self::Bypass => "bypass",
            Self::Handoff => "handoff",
        }
    }

    /// First line of every system prompt for this stage.
    pub fn header(&self) -> String {
        format!("## Stage: {}", self.as_str())
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        for stage in Stage::ALL {
            let prompt = format!("{}\nInstructions follow.", stage.header());
            assert_eq!(Stage::from_header(&prompt), Some(stage));
        }
        assert_eq!(Stage::from_header("You are helpful."), None);
    }
}
