//! Shared network plumbing used by the active stage and exposed to the
//! data-source runtime: page pulls and crawling, certificate grabs, zone
//! transfers.

pub mod http;
pub mod tls;
pub mod xfer;

use std::time::Duration;

/// TCP dial budget for raw connections.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(20);

/// Budget for one HTTP request.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// Overall budget for one crawl.
pub const CRAWL_TIMEOUT: Duration = Duration::from_secs(120);

/// Connect and read budgets for zone transfers.
pub const XFR_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const XFR_READ_TIMEOUT: Duration = Duration::from_secs(30);
