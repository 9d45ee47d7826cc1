//! Signal extraction from raw response text.
//!
//! Signals can sit at any depth of the payload, so matching runs over the
//! serialized text rather than a parsed structure.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static TWO_STEP_SET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"设置两步密码【(\d+)】成功").expect("valid two-step regex"));

static VERIFICATION_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"验证码[:：]\s*([A-Za-z0-9]+)").expect("valid verification code regex")
});

/// Display text used when nothing matched.
pub const NO_SIGNAL_TEXT: &str = "否";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalKind {
    TwoStepPassword,
    VerificationCode,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signal {
    pub kind: SignalKind,
    pub has_2fa: bool,
    pub code: Option<String>,
    pub display_text: String,
}

impl Signal {
    fn none() -> Self {
        Self {
            kind: SignalKind::None,
            has_2fa: false,
            code: None,
            display_text: NO_SIGNAL_TEXT.to_string(),
        }
    }
}

/// Extract the first matching signal. The two-step confirmation wins over a
/// plain verification code when both appear.
pub fn extract_signal(response_text: &str) -> Signal {
    if let Some(caps) = TWO_STEP_SET.captures(response_text) {
        return Signal {
            kind: SignalKind::TwoStepPassword,
            has_2fa: true,
            code: caps.get(1).map(|m| m.as_str().to_string()),
            display_text: caps
                .get(0)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        };
    }

    if let Some(code) = VERIFICATION_CODE.captures(response_text).and_then(|c| c.get(1)) {
        let code = code.as_str().to_string();
        return Signal {
            kind: SignalKind::VerificationCode,
            has_2fa: true,
            display_text: format!("验证码: {}", code),
            code: Some(code),
        };
    }

    Signal::none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_step_confirmation() {
        let s = extract_signal("设置两步密码【778899】成功");
        assert!(s.has_2fa);
        assert_eq!(s.kind, SignalKind::TwoStepPassword);
        assert_eq!(s.code.as_deref(), Some("778899"));
        assert_eq!(s.display_text, "设置两步密码【778899】成功");
    }

    #[test]
    fn verification_code() {
        let s = extract_signal("验证码: ABC123");
        assert!(s.has_2fa);
        assert_eq!(s.kind, SignalKind::VerificationCode);
        assert_eq!(s.code.as_deref(), Some("ABC123"));
        assert_eq!(s.display_text, "验证码: ABC123");

        let s = extract_signal("验证码：98765");
        assert_eq!(s.code.as_deref(), Some("98765"));
    }

    #[test]
    fn no_signal() {
        let s = extract_signal("no signal here");
        assert!(!s.has_2fa);
        assert_eq!(s.kind, SignalKind::None);
        assert!(s.code.is_none());
        assert_eq!(s.display_text, NO_SIGNAL_TEXT);

        assert_eq!(extract_signal("").kind, SignalKind::None);
    }

    #[test]
    fn nested_in_serialized_json() {
        let payload = serde_json::json!({
            "data": {"data": [{"log": [{"msg": "设置两步密码【123456】成功"}]}]}
        });
        let s = extract_signal(&serde_json::to_string(&payload).unwrap());
        assert_eq!(s.code.as_deref(), Some("123456"));
    }

    #[test]
    fn first_match_wins_when_both_present() {
        let s = extract_signal("验证码: XYZ999 ... 设置两步密码【111222】成功");
        assert_eq!(s.kind, SignalKind::TwoStepPassword);
        assert_eq!(s.code.as_deref(), Some("111222"));
    }
}
