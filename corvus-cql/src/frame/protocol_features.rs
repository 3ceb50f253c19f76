//! Vendor protocol extensions negotiated through the SUPPORTED options map.

use std::borrow::Cow;
use std::collections::HashMap;

const RATE_LIMIT_ERROR_EXTENSION: &str = "CORVUS_RATE_LIMIT_ERROR";
pub(crate) const LWT_MARK_EXTENSION: &str = "CORVUS_LWT_ADD_METADATA_MARK";

/// Extensions the server advertised in SUPPORTED and the driver opted into
/// in STARTUP. All of them default to "absent".
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolFeatures {
    pub rate_limit_error: Option<i32>,
    pub lwt_optimization_meta_bit_mask: Option<u32>,
}

impl ProtocolFeatures {
    pub fn parse_from_supported(supported: &HashMap<String, Vec<String>>) -> Self {
        Self {
            rate_limit_error: Self::maybe_parse_rate_limit_error(supported),
            lwt_optimization_meta_bit_mask: Self::maybe_parse_lwt_optimization_meta_bit_mask(
                supported,
            ),
        }
    }

    fn maybe_parse_rate_limit_error(supported: &HashMap<String, Vec<String>>) -> Option<i32> {
        let vals = supported.get(RATE_LIMIT_ERROR_EXTENSION)?;
        let code_str = Self::get_cql_extension_field(vals.as_slice(), "ERROR_CODE")?;
        code_str.parse::<i32>().ok()
    }

    fn maybe_parse_lwt_optimization_meta_bit_mask(
        supported: &HashMap<String, Vec<String>>,
    ) -> Option<u32> {
        let vals = supported.get(LWT_MARK_EXTENSION)?;
        let mask_str = Self::get_cql_extension_field(vals.as_slice(), "LWT_OPTIMIZATION_META_BIT_MASK")?;
        mask_str.parse::<u32>().ok()
    }

    // Extension value strings have the form "FIELD1=VALUE1", "FIELD2=VALUE2", ...
    fn get_cql_extension_field<'a>(vals: &'a [String], key: &str) -> Option<&'a str> {
        vals.iter()
            .find_map(|v| v.as_str().split_once('='))
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// Adds the opt-in entries for every recognized extension to the STARTUP
    /// options map.
    pub fn add_startup_options(&self, options: &mut HashMap<Cow<'_, str>, Cow<'_, str>>) {
        if self.rate_limit_error.is_some() {
            options.insert(Cow::Borrowed(RATE_LIMIT_ERROR_EXTENSION), Cow::Borrowed(""));
        }
        if let Some(mask) = self.lwt_optimization_meta_bit_mask {
            options.insert(
                Cow::Borrowed(LWT_MARK_EXTENSION),
                Cow::Owned(format!("LWT_OPTIMIZATION_META_BIT_MASK={}", mask)),
            );
        }
    }

    pub fn prepared_flags_contain_lwt_mark(&self, flags: u32) -> bool {
        self.lwt_optimization_meta_bit_mask
            .map(|mask| (flags & mask) == mask)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rate_limit_extension() {
        let mut supported = HashMap::new();
        supported.insert(
            RATE_LIMIT_ERROR_EXTENSION.to_owned(),
            vec!["ERROR_CODE=123".to_owned()],
        );
        let features = ProtocolFeatures::parse_from_supported(&supported);
        assert_eq!(features.rate_limit_error, Some(123));
        assert_eq!(features.lwt_optimization_meta_bit_mask, None);
    }

    #[test]
    fn absent_extensions_stay_default() {
        let features = ProtocolFeatures::parse_from_supported(&HashMap::new());
        assert_eq!(features, ProtocolFeatures::default());
    }
}
