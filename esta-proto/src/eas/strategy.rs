//! Per-client behavioral dialects.
//!
//! Exchange clients disagree about details the protocol documents leave
//! open: whether the first sync response may carry data, how big a window
//! to assume, which body format to prefer. Each dialect is a parameter
//! table; one is chosen per request by substring matching on the
//! user-agent and device-type strings, then passed around by reference.

/// Soft cap on the encoded size of one batch.
const BATCH_BYTE_BUDGET: usize = 50 * 1024;
/// Hard cap on Type 4 (raw MIME) truncation.
const MIME_TRUNCATION_CAP: u32 = 512 * 1024;

#[derive(Debug)]
pub struct ClientStrategy {
    pub name: &'static str,
    /// The first response to `SyncKey=0` must contain no `<Commands>`;
    /// data starts flowing on the follow-up request.
    pub needs_empty_initial_response: bool,
    pub default_window_size: u32,
    pub max_window_size: u32,
    /// Server-side preference when the client omits `<BodyPreference>`.
    pub body_preference_order: &'static [u8],
    pub batch_byte_budget: usize,
    pub uses_two_phase_commit: bool,
}

pub static IOS: ClientStrategy = ClientStrategy {
    name: "ios",
    needs_empty_initial_response: false,
    default_window_size: 50,
    max_window_size: 100,
    body_preference_order: &[1, 2, 4],
    batch_byte_budget: BATCH_BYTE_BUDGET,
    uses_two_phase_commit: true,
};

pub static OUTLOOK: ClientStrategy = ClientStrategy {
    name: "outlook",
    needs_empty_initial_response: true,
    default_window_size: 25,
    max_window_size: 100,
    body_preference_order: &[4, 1, 2],
    batch_byte_budget: BATCH_BYTE_BUDGET,
    uses_two_phase_commit: true,
};

pub static ANDROID: ClientStrategy = ClientStrategy {
    name: "android",
    needs_empty_initial_response: false,
    default_window_size: 25,
    max_window_size: 100,
    body_preference_order: &[1, 2, 4],
    batch_byte_budget: BATCH_BYTE_BUDGET,
    uses_two_phase_commit: true,
};

pub static DEFAULT: ClientStrategy = ClientStrategy {
    name: "default",
    needs_empty_initial_response: false,
    default_window_size: 25,
    max_window_size: 100,
    body_preference_order: &[1, 2, 4],
    batch_byte_budget: BATCH_BYTE_BUDGET,
    uses_two_phase_commit: true,
};

impl ClientStrategy {
    pub fn detect(user_agent: &str, device_type: &str) -> &'static ClientStrategy {
        let ua = user_agent.to_ascii_lowercase();
        let dt = device_type.to_ascii_lowercase();

        for haystack in [ua.as_str(), dt.as_str()] {
            if ["iphone", "ipad", "ipod", "apple", "ios"]
                .iter()
                .any(|n| haystack.contains(n))
            {
                return &IOS;
            }
            if haystack.contains("outlook") || haystack.contains("windowsoutlook") {
                return &OUTLOOK;
            }
            if haystack.contains("android") || haystack.contains("samsung") {
                return &ANDROID;
            }
        }
        &DEFAULT
    }

    /// Clamp the client's `<WindowSize>` into `[1, max]`; absence picks the
    /// dialect default.
    pub fn clamp_window(&self, requested: Option<u32>) -> u32 {
        match requested {
            None => self.default_window_size,
            Some(n) => n.clamp(1, self.max_window_size),
        }
    }

    /// The truncation bound actually applied to a body. Types 1 and 2
    /// honor the client exactly; overriding with a server minimum makes
    /// iOS abandon truncation outright and ask for 32 KB bodies instead.
    /// Type 4 is capped because nothing needs a megabyte MIME preview.
    pub fn effective_truncation(
        &self,
        body_type: u8,
        client_requested: Option<u32>,
        _is_initial_sync: bool,
    ) -> Option<u32> {
        match body_type {
            4 => Some(
                client_requested
                    .unwrap_or(MIME_TRUNCATION_CAP)
                    .min(MIME_TRUNCATION_CAP),
            ),
            _ => client_requested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_by_substring() {
        assert_eq!(ClientStrategy::detect("Apple-iPhone12C1/1905", "iPhone").name, "ios");
        assert_eq!(
            ClientStrategy::detect("Microsoft Office Outlook 16.0", "WindowsOutlook15").name,
            "outlook"
        );
        assert_eq!(ClientStrategy::detect("Android-Mail/2023", "SAMSUNGSMG991B").name, "android");
        assert_eq!(ClientStrategy::detect("curl/8.0", "Gecko").name, "default");
    }

    #[test]
    fn detection_is_case_insensitive() {
        assert_eq!(ClientStrategy::detect("APPLE-IPAD", "").name, "ios");
        assert_eq!(ClientStrategy::detect("", "OUTLOOK").name, "outlook");
    }

    #[test]
    fn window_clamping() {
        assert_eq!(IOS.clamp_window(None), 50);
        assert_eq!(IOS.clamp_window(Some(0)), 1);
        assert_eq!(IOS.clamp_window(Some(10_000)), 100);
        assert_eq!(OUTLOOK.clamp_window(None), 25);
    }

    #[test]
    fn truncation_honors_client_for_text_types() {
        assert_eq!(IOS.effective_truncation(1, Some(500), true), Some(500));
        assert_eq!(IOS.effective_truncation(2, Some(500), false), Some(500));
        assert_eq!(IOS.effective_truncation(1, None, false), None);
    }

    #[test]
    fn truncation_caps_mime() {
        assert_eq!(IOS.effective_truncation(4, Some(1 << 30), false), Some(512 * 1024));
        assert_eq!(IOS.effective_truncation(4, None, false), Some(512 * 1024));
        assert_eq!(IOS.effective_truncation(4, Some(1024), false), Some(1024));
    }
}
