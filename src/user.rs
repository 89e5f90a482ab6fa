// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The `users` entity in its two shapes.
//!
//! - [`UserRecord`]: the relational row (ground truth), timestamps as `DateTime<Utc>`
//! - [`UserDocument`]: the search projection, timestamps as epoch seconds
//!
//! ```
//! use search_sync::user::{UserProfile, UserRecord};
//! use chrono::{TimeZone, Utc};
//!
//! let created = Utc.with_ymd_and_hms(2025, 3, 1, 8, 16, 7).unwrap();
//! let row = UserRecord::new("u-1", UserProfile::default(), created);
//! let doc = row.to_document();
//! assert_eq!(doc.id, "u-1");
//! assert_eq!(doc.created_at, created.timestamp());
//! assert_eq!(doc.updated_at, None);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Business fields shared by rows, documents and create requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub date_of_birth: String,
    pub age: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub direction: String,
    pub country: String,
    pub postal_code: String,
}

/// Payload for creating a user.
pub type NewUser = UserProfile;

/// Partial update. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
}

impl UserPatch {
    /// Apply the set fields onto a profile.
    pub fn apply_to(&self, profile: &mut UserProfile) {
        let pairs: [(&Option<String>, &mut String); 11] = [
            (&self.name, &mut profile.name),
            (&self.email, &mut profile.email),
            (&self.phone, &mut profile.phone),
            (&self.date_of_birth, &mut profile.date_of_birth),
            (&self.age, &mut profile.age),
            (&self.address, &mut profile.address),
            (&self.city, &mut profile.city),
            (&self.state, &mut profile.state),
            (&self.direction, &mut profile.direction),
            (&self.country, &mut profile.country),
            (&self.postal_code, &mut profile.postal_code),
        ];
        for (value, slot) in pairs {
            if let Some(v) = value {
                slot.clone_from(v);
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// A relational row observed by the change poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub profile: UserProfile,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub is_sync: bool,
}

impl UserRecord {
    #[must_use]
    pub fn new(id: impl Into<String>, profile: UserProfile, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            profile,
            created_at,
            updated_at: None,
            deleted_at: None,
            is_sync: false,
        }
    }

    /// Instant of the last write that the poller should observe.
    #[must_use]
    pub fn change_time(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }

    #[must_use]
    pub fn to_document(&self) -> UserDocument {
        UserDocument {
            id: self.id.clone(),
            profile: self.profile.clone(),
            created_at: self.created_at.timestamp(),
            updated_at: self.updated_at.map(|t| t.timestamp()),
            deleted_at: self.deleted_at.map(|t| t.timestamp()),
            formatted: None,
            matches_position: None,
        }
    }
}

/// Search projection of a [`UserRecord`].
///
/// Absent timestamps serialize as explicit `null`: the index filter `IS NULL`
/// only matches fields that are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDocument {
    pub id: String,
    #[serde(flatten)]
    pub profile: UserProfile,
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub deleted_at: Option<i64>,
    /// Highlighted fields, only present on search responses
    #[serde(rename = "_formatted", default, skip_serializing_if = "Option::is_none")]
    pub formatted: Option<Map<String, Value>>,
    #[serde(rename = "_matchesPosition", default, skip_serializing_if = "Option::is_none")]
    pub matches_position: Option<Map<String, Value>>,
}

impl UserDocument {
    /// Serialize into the JSON object sent to the index.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
