use std::sync::Arc;

use credmux_common::ModelId;

use crate::ledger::UsageLedger;

/// The acquisition receipt for one (credential, model) lease. Every exit
/// path of a dispatch — success, classified failure, or cancellation —
/// must release its lease exactly once (spec.md §9 "Scoped resource
/// release"). Call [`Lease::release`] on the happy path; if a lease is
/// dropped without that call (task cancellation, panic unwind), `Drop`
/// schedules the release itself so `in_flight` never leaks.
pub struct Lease {
    ledger: Arc<UsageLedger>,
    credential: String,
    model: ModelId,
    released: bool,
}

impl Lease {
    pub(crate) fn new(ledger: Arc<UsageLedger>, credential: String, model: ModelId) -> Self {
        Self {
            ledger,
            credential,
            model,
            released: false,
        }
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn model(&self) -> &ModelId {
        &self.model
    }

    pub async fn release(mut self) {
        self.released = true;
        self.ledger.release(&self.credential, &self.model).await;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let ledger = self.ledger.clone();
        let credential = self.credential.clone();
        let model = self.model.clone();
        tokio::spawn(async move {
            ledger.release(&credential, &model).await;
        });
    }
}
