use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    Msi,
    Msp,
    Exe,
    Msu,
}

impl PackageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Msi => "msi",
            Self::Msp => "msp",
            Self::Exe => "exe",
            Self::Msu => "msu",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "msi" => Some(Self::Msi),
            "msp" => Some(Self::Msp),
            "exe" => Some(Self::Exe),
            "msu" => Some(Self::Msu),
            _ => None,
        }
    }

    pub fn infer_from_path(path: &str) -> Option<Self> {
        let lower = path.to_ascii_lowercase();
        let without_fragment = lower.split('#').next().unwrap_or(&lower);
        let without_query = without_fragment
            .split('?')
            .next()
            .unwrap_or(without_fragment);
        let file_name = without_query
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(without_query);
        let (_, extension) = file_name.rsplit_once('.')?;
        Self::parse(extension)
    }

    /// Whether removing a package of this kind needs its payloads on disk.
    ///
    /// Installer-database packages uninstall by product or patch code; an
    /// executable has to be run again with its uninstall arguments.
    pub fn uninstall_needs_payloads(self) -> bool {
        matches!(self, Self::Exe)
    }
}
