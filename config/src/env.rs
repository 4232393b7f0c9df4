// SPDX-License-Identifier: MPL-2.0-only

//! Environment overrides for the decoder settings.

use crate::DecoderSettings;

pub const DECODER_ENV: &str = "LOOPFRAME_DECODER";
pub const FORCE_SOFTWARE_ENV: &str = "LOOPFRAME_FORCE_SOFTWARE";
pub const LIST_DECODERS_ENV: &str = "LOOPFRAME_LIST_DECODERS";

impl DecoderSettings {
    /// Apply `LOOPFRAME_*` overrides from the process environment.
    pub fn apply_env(self) -> Self {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(name) = lookup(DECODER_ENV).filter(|name| !name.trim().is_empty()) {
            self.decoder_override = Some(name.trim().to_owned());
        }
        if let Some(value) = lookup(FORCE_SOFTWARE_ENV) {
            self.force_software = is_truthy(&value);
        }
        if let Some(value) = lookup(LIST_DECODERS_ENV) {
            self.debug_list = is_truthy(&value);
        }
        self
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
