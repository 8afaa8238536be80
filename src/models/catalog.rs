use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one rate catalog: work category, state and work type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRef {
    pub category: String,
    pub state: String,
    pub work_type: String,
}

impl CatalogRef {
    pub fn new(
        category: impl Into<String>,
        state: impl Into<String>,
        work_type: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            state: state.into(),
            work_type: work_type.into(),
        }
    }
}

impl fmt::Display for CatalogRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.category, self.state, self.work_type)
    }
}
