use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Access a participant has to one document.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    None,
    View,
    Edit,
}

impl Permission {
    pub fn can_join(self) -> bool {
        self >= Permission::View
    }

    pub fn can_edit(self) -> bool {
        self == Permission::Edit
    }

    /// Parse the permission string returned by the application service.
    pub fn from_app_service(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "edit" | "manage" | "write" => Permission::Edit,
            "view" | "read" => Permission::View,
            _ => Permission::None,
        }
    }
}
