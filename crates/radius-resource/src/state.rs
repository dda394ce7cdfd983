use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Lifecycle state of a resource or an asynchronous operation.
///
/// `Succeeded`, `Failed` and `Canceled` are terminal; everything else means
/// the back-end still owns the resource.
#[derive(
    Clone, Copy, Debug, Default, Display, EnumString, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum ProvisioningState {
    #[default]
    Accepted,
    Updating,
    Deleting,
    Succeeded,
    Failed,
    Canceled,
}

impl ProvisioningState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ProvisioningState::Accepted, false)]
    #[case(ProvisioningState::Updating, false)]
    #[case(ProvisioningState::Deleting, false)]
    #[case(ProvisioningState::Succeeded, true)]
    #[case(ProvisioningState::Failed, true)]
    #[case(ProvisioningState::Canceled, true)]
    fn terminality(#[case] state: ProvisioningState, #[case] terminal: bool) {
        assert_eq!(state.is_terminal(), terminal);
    }

    #[test]
    fn wire_form_is_pascal_case() {
        let json = serde_json::to_string(&ProvisioningState::Succeeded).unwrap();
        assert_eq!(json, "\"Succeeded\"");
    }
}
