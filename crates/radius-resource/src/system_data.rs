use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// The kind of identity that created or modified a resource.
#[derive(Clone, Copy, Debug, Default, Display, EnumString, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityType {
    Application,
    Key,
    ManagedIdentity,
    #[default]
    User,
}

/// ARM `systemData` envelope stamped onto every persisted resource.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by_type: Option<IdentityType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_by_type: Option<IdentityType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<DateTime<Utc>>,
}

impl SystemData {
    /// Stamps a fresh modification, preserving creation fields when the
    /// resource already existed.
    pub fn touch(&mut self, by: &str, by_type: IdentityType, now: DateTime<Utc>) {
        if self.created_at.is_none() {
            self.created_by = Some(by.to_owned());
            self.created_by_type = Some(by_type);
            self.created_at = Some(now);
        }
        self.last_modified_by = Some(by.to_owned());
        self.last_modified_by_type = Some(by_type);
        self.last_modified_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_preserves_creation() {
        let mut data = SystemData::default();
        let first = Utc::now();
        data.touch("alice", IdentityType::User, first);
        assert_eq!(data.created_at, Some(first));

        let second = Utc::now();
        data.touch("bot", IdentityType::ManagedIdentity, second);
        assert_eq!(data.created_by.as_deref(), Some("alice"));
        assert_eq!(data.created_at, Some(first));
        assert_eq!(data.last_modified_by.as_deref(), Some("bot"));
        assert_eq!(data.last_modified_at, Some(second));
    }
}
