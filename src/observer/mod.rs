//! Event observers: everything that happens to a confirmed event after
//! the monitor hands it over. Observers never fail their caller; anything
//! unexpected is logged, paged and skipped so the monitor loop keeps
//! advancing.

use async_trait::async_trait;
use url::Url;

use crate::monitor::EventEnvelope;

pub mod burn;
pub mod ncg;

pub use burn::BurnEventObserver;
pub use ncg::NcgTransferObserver;

#[async_trait]
pub trait EventObserver<E>: Send + Sync {
    async fn observe(&self, envelope: &EventEnvelope<E>);
}

/// Block-explorer bases used to render human-readable transaction links
/// in chat messages and audit documents.
#[derive(Debug, Clone)]
pub struct ExplorerUrls {
    pub nine_chronicles: Url,
    pub ethereum: Url,
}

impl ExplorerUrls {
    pub fn nine_chronicles_tx(&self, tx_id: &str) -> String {
        format!(
            "{}/tx/{tx_id}",
            self.nine_chronicles.as_str().trim_end_matches('/')
        )
    }

    pub fn ethereum_tx(&self, tx_id: &str) -> String {
        format!("{}/tx/{tx_id}", self.ethereum.as_str().trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explorer_links_ignore_trailing_slashes() {
        let urls = ExplorerUrls {
            nine_chronicles: "https://9cscan.com/".parse().unwrap(),
            ethereum: "https://etherscan.io".parse().unwrap(),
        };
        assert_eq!(
            urls.nine_chronicles_tx("abcd"),
            "https://9cscan.com/tx/abcd"
        );
        assert_eq!(urls.ethereum_tx("0x12"), "https://etherscan.io/tx/0x12");
    }
}
