//! Write-once identity fields.
//!
//! Serial number, unique ID and display name are each set at most once and
//! read any number of times afterwards. The fields are independent of each
//! other and of the pairing state.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{FobError, FobResult};

pub const SERIAL_NUMBER_LEN: usize = 16;
pub const UNIQUE_ID_LEN: usize = 16;
pub const DISPLAY_NAME_MAX_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentityField {
    SerialNumber,
    UniqueId,
    DisplayName,
}

impl IdentityField {
    pub const ALL: [IdentityField; 3] = [
        IdentityField::SerialNumber,
        IdentityField::UniqueId,
        IdentityField::DisplayName,
    ];

    pub fn label(self) -> &'static str {
        match self {
            IdentityField::SerialNumber => "serial number",
            IdentityField::UniqueId => "unique id",
            IdentityField::DisplayName => "display name",
        }
    }

    /// Check `len` against the field's capacity.
    pub fn validate_len(self, len: usize) -> FobResult<()> {
        match self {
            IdentityField::SerialNumber => FobError::check_len(SERIAL_NUMBER_LEN, len),
            IdentityField::UniqueId => FobError::check_len(UNIQUE_ID_LEN, len),
            IdentityField::DisplayName => {
                if len == 0 || len > DISPLAY_NAME_MAX_LEN {
                    return Err(FobError::MalformedRequest(format!(
                        "display name must be 1..={} bytes, got {}",
                        DISPLAY_NAME_MAX_LEN, len
                    )));
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for IdentityField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityStore {
    serial_number: Option<[u8; SERIAL_NUMBER_LEN]>,
    unique_id: Option<[u8; UNIQUE_ID_LEN]>,
    display_name: Option<Vec<u8>>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self, field: IdentityField) -> bool {
        match field {
            IdentityField::SerialNumber => self.serial_number.is_some(),
            IdentityField::UniqueId => self.unique_id.is_some(),
            IdentityField::DisplayName => self.display_name.is_some(),
        }
    }

    /// Set `field` once. Length is checked before the one-time flag.
    pub fn store_field(&mut self, field: IdentityField, bytes: &[u8]) -> FobResult<()> {
        field.validate_len(bytes.len())?;
        if self.is_set(field) {
            warn!(%field, "identity field already set");
            return Err(FobError::AlreadySet(field.label()));
        }

        match field {
            IdentityField::SerialNumber => {
                let mut v = [0u8; SERIAL_NUMBER_LEN];
                v.copy_from_slice(bytes);
                self.serial_number = Some(v);
            }
            IdentityField::UniqueId => {
                let mut v = [0u8; UNIQUE_ID_LEN];
                v.copy_from_slice(bytes);
                self.unique_id = Some(v);
            }
            IdentityField::DisplayName => self.display_name = Some(bytes.to_vec()),
        }
        debug!(%field, len = bytes.len(), "identity field stored");
        Ok(())
    }

    pub fn read_field(&self, field: IdentityField) -> FobResult<Vec<u8>> {
        let value = match field {
            IdentityField::SerialNumber => self.serial_number.map(|v| v.to_vec()),
            IdentityField::UniqueId => self.unique_id.map(|v| v.to_vec()),
            IdentityField::DisplayName => self.display_name.clone(),
        };
        value.ok_or(FobError::NotSet(field.label()))
    }

    /// Rebuild from persisted values, rejecting values of the wrong length.
    pub fn restore(
        serial_number: Option<&[u8]>,
        unique_id: Option<&[u8]>,
        display_name: Option<&[u8]>,
    ) -> FobResult<Self> {
        let mut store = Self::new();
        if let Some(v) = serial_number {
            store.store_field(IdentityField::SerialNumber, v)?;
        }
        if let Some(v) = unique_id {
            store.store_field(IdentityField::UniqueId, v)?;
        }
        if let Some(v) = display_name {
            store.store_field(IdentityField::DisplayName, v)?;
        }
        Ok(store)
    }

    pub fn raw(&self, field: IdentityField) -> Option<&[u8]> {
        match field {
            IdentityField::SerialNumber => self.serial_number.as_ref().map(|v| &v[..]),
            IdentityField::UniqueId => self.unique_id.as_ref().map(|v| &v[..]),
            IdentityField::DisplayName => self.display_name.as_deref(),
        }
    }
}
