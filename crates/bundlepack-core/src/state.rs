use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CurrentState {
    #[default]
    Unknown,
    Absent,
    Present,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    #[default]
    None,
    Present,
    Absent,
    Repair,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ActionState {
    #[default]
    None,
    Install,
    Uninstall,
    Repair,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LaunchAction {
    #[default]
    Install,
    Repair,
    Uninstall,
    Modify,
    Layout,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    None,
    Passive,
    #[default]
    Full,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    Never,
    #[default]
    Prompt,
    Automatic,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ResumeMode {
    #[default]
    None,
    Active,
    Suspend,
    RebootPending,
    Arp,
}

/// Result of running one package action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "outcome", content = "code")]
pub enum ExecuteOutcome {
    Success,
    Error(i32),
    RebootRequired,
    RebootForced,
}

impl ActionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Repair => "repair",
        }
    }

    pub fn is_none(self) -> bool {
        self == Self::None
    }
}

impl CurrentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Absent => "absent",
            Self::Present => "present",
        }
    }

    /// State expected after `action` completes successfully from `self`.
    pub fn after(self, action: ActionState) -> Self {
        match action {
            ActionState::None => self,
            ActionState::Install | ActionState::Repair => Self::Present,
            ActionState::Uninstall => Self::Absent,
        }
    }
}

impl RequestState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Repair => "repair",
        }
    }
}

impl LaunchAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Repair => "repair",
            Self::Uninstall => "uninstall",
            Self::Modify => "modify",
            Self::Layout => "layout",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "install" => Ok(Self::Install),
            "repair" => Ok(Self::Repair),
            "uninstall" => Ok(Self::Uninstall),
            "modify" => Ok(Self::Modify),
            "layout" => Ok(Self::Layout),
            _ => Err(anyhow!("invalid launch action: {value}")),
        }
    }
}

impl ResumeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Active => "active",
            Self::Suspend => "suspend",
            Self::RebootPending => "reboot-pending",
            Self::Arp => "arp",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(Self::None),
            "active" => Ok(Self::Active),
            "suspend" => Ok(Self::Suspend),
            "reboot-pending" => Ok(Self::RebootPending),
            "arp" => Ok(Self::Arp),
            _ => Err(anyhow!("invalid resume mode: {value}")),
        }
    }

    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Active | Self::Suspend | Self::RebootPending)
    }
}

impl ExecuteOutcome {
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::Success | Self::RebootRequired | Self::RebootForced
        )
    }

    pub fn is_reboot(self) -> bool {
        matches!(self, Self::RebootRequired | Self::RebootForced)
    }
}
