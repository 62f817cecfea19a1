//! Web application firewall block-page rejection.
//!
//! WAFs are normally caught by the generic directives, such as status-code
//! rejection or the behavior detections. Some of them misbehave enough to
//! need custom rules.

use async_trait::async_trait;

use crate::error::{HammerTimeError, RuleResult};
use crate::http::Entry;
use crate::ruleset::Heuristic;

/// BIG-IP ASM returns 200 with a long unique identifier that keeps the
/// behavior detections from converging.
const BIGIP_ASM: &[u8] =
    b"<body>The requested URL was rejected. Please consult with your administrator.<br>";

/// Rejects responses that are WAF block pages in disguise.
#[derive(Default)]
pub struct RejectWebApplicationFirewall;

#[async_trait]
impl Heuristic for RejectWebApplicationFirewall {
    async fn after_response(&self, entry: &mut Entry) -> RuleResult {
        if let Some(response) = &entry.response {
            if contains(response.raw(), BIGIP_ASM) {
                return Err(HammerTimeError::reject("BIG-IP ASM triggered"));
            }
        }
        Ok(())
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len()
        && haystack
            .windows(needle.len())
            .any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::entry_with_response;

    #[tokio::test]
    async fn block_page_is_rejected() {
        let body = format!(
            "<html>{}</body></html>",
            String::from_utf8_lossy(BIGIP_ASM)
        );
        let mut entry = entry_with_response("http://example.com/x", 200, &body);
        let result = RejectWebApplicationFirewall
            .after_response(&mut entry)
            .await;
        assert!(matches!(result, Err(HammerTimeError::Reject(_))));
    }

    #[tokio::test]
    async fn normal_pages_pass() {
        let mut entry = entry_with_response("http://example.com/x", 200, "<html>welcome</html>");
        RejectWebApplicationFirewall
            .after_response(&mut entry)
            .await
            .unwrap();
    }
}
