use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Why a page is being told to block itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    FocusMode,
    DailyLimit,
}

/// A directive for the page collaborator on a tracked domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSignal {
    BlockSite { reason: BlockReason },
    Warning { text: String },
}

/// Seam for the page-overlay collaborator. The controller decides; the sink
/// delivers.
pub trait PageSink: Send + Sync {
    fn block(&self, domain: &str, reason: BlockReason);
    fn warn(&self, domain: &str, text: &str);
}

/// Seam for the audio collaborator. Failures are the caller's to log; they
/// never block a state transition.
pub trait SoundPlayer: Send + Sync {
    /// Play the session-completion chime.
    ///
    /// # Errors
    ///
    /// Returns an error if audio output is unavailable.
    fn play_completion(&self) -> anyhow::Result<()>;
}

/// Production [`PageSink`]: stores the latest directive per domain, where the
/// page companion retrieves (and clears) it over IPC. A newer directive for
/// the same domain replaces the older one; only the latest matters.
#[derive(Default)]
pub struct PendingSignals {
    inner: Mutex<HashMap<String, PageSignal>>,
}

impl PendingSignals {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return the pending directive for a domain, if any.
    pub fn take(&self, domain: &str) -> Option<PageSignal> {
        match self.inner.lock() {
            Ok(mut map) => map.remove(domain),
            Err(poisoned) => poisoned.into_inner().remove(domain),
        }
    }

    fn put(&self, domain: &str, signal: PageSignal) {
        match self.inner.lock() {
            Ok(mut map) => {
                map.insert(domain.to_string(), signal);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(domain.to_string(), signal);
            }
        }
    }
}

impl PageSink for PendingSignals {
    fn block(&self, domain: &str, reason: BlockReason) {
        self.put(domain, PageSignal::BlockSite { reason });
    }

    fn warn(&self, domain: &str, text: &str) {
        self.put(
            domain,
            PageSignal::Warning {
                text: text.to_string(),
            },
        );
    }
}
