//! Built-in heuristics.
//!
//! Each module hosts one concern; everything is re-exported here so callers
//! can `use hammertime::rules::DetectSoft404` directly.

pub mod behavior;
pub mod body;
pub mod dead_host;
pub mod header;
pub mod redirects;
pub mod reject_redirects;
pub mod sampling;
pub mod simhash;
pub mod soft404;
pub mod status;
pub mod timeout;
pub mod url_filter;
pub mod waf;

pub use behavior::{DetectBehaviorChange, RejectErrorBehavior};
pub use body::{BodySize, IgnoreLargeBody};
pub use dead_host::DeadHostDetection;
pub use header::SetHeader;
pub use redirects::{FollowRedirects, VALID_REDIRECTS};
pub use reject_redirects::RejectCatchAllRedirect;
pub use sampling::{
    ContentHashSampling, ContentSampleSampling, ContentSignature, ContentSimhashSampling,
    SignatureComparator,
};
pub use simhash::Simhash;
pub use soft404::{DetectSoft404, RejectSoft404, SimilarPathGenerator};
pub use status::RejectStatusCode;
pub use timeout::{DynamicTimeout, TimeoutManager};
pub use url_filter::FilterRequestFromURL;
pub use waf::RejectWebApplicationFirewall;
