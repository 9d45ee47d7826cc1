//! View models returned by repository queries.
//!
//! Keep these structs focused on the data a query returns. Business logic
//! lives in higher layers.

/// Slice used to warm the dedup cache at engine startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAccount {
    pub account_id: String,
    pub has_2fa: bool,
    pub latest_code: Option<String>,
}
