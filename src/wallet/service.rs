//! Wallet service
//!
//! Thin layer over [`WalletStore`] for the operations the API exposes.

use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{AmountDelta, CurrencyCode};

use super::{
    HistoryPage, PageRequest, Wallet, WalletError, WalletLookup, WalletStore, WalletTransaction,
};

#[derive(Clone)]
pub struct WalletService {
    store: Arc<dyn WalletStore>,
}

impl WalletService {
    pub fn new(store: Arc<dyn WalletStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn WalletStore> {
        &self.store
    }

    /// Create the wallet, or return the existing one for the same (owner, app).
    ///
    /// The flag is `true` when this call created it.
    pub async fn open_wallet(
        &self,
        owner_user_id: &str,
        app_id: Option<&str>,
        currency: &CurrencyCode,
    ) -> Result<(Wallet, bool), WalletError> {
        match self.store.create_wallet(owner_user_id, app_id, currency).await {
            Ok(wallet) => {
                tracing::info!(wallet_id = %wallet.id, owner = owner_user_id, "Wallet created");
                Ok((wallet, true))
            }
            Err(e @ WalletError::DuplicateWallet { .. }) => {
                let lookup = match app_id {
                    Some(app) => WalletLookup::ByOwnerAndApp {
                        owner_user_id: owner_user_id.to_string(),
                        app_id: app.to_string(),
                    },
                    None => WalletLookup::ByOwner(owner_user_id.to_string()),
                };
                match self.store.get_wallet(lookup).await? {
                    Some(existing) => Ok((existing, false)),
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn wallet(&self, wallet_id: Uuid) -> Result<Wallet, WalletError> {
        self.store
            .get_wallet(WalletLookup::ById(wallet_id))
            .await?
            .ok_or(WalletError::WalletNotFound(wallet_id))
    }

    /// Register a pending transaction for a payment that has not settled yet.
    ///
    /// Registering an intent twice returns the existing transaction with the
    /// flag `false`; a different amount for the same intent is a duplicate.
    pub async fn register_pending(
        &self,
        wallet_id: Uuid,
        payment_intent_id: &str,
        amount_delta: AmountDelta,
    ) -> Result<(WalletTransaction, bool), WalletError> {
        if payment_intent_id.trim().is_empty() {
            return Err(WalletError::Validation("payment_intent_id is empty".into()));
        }
        match self
            .store
            .append_transaction(
                wallet_id,
                WalletTransaction::pending(payment_intent_id, amount_delta),
            )
            .await
        {
            Ok(transaction) => Ok((transaction, true)),
            Err(e @ WalletError::DuplicateTransaction { .. }) => {
                let existing = self.wallet(wallet_id).await?.transaction(payment_intent_id).cloned();
                match existing {
                    Some(tx) if tx.amount_delta == amount_delta => {
                        tracing::debug!(
                            wallet_id = %wallet_id,
                            payment_intent_id = payment_intent_id,
                            "Transaction already registered"
                        );
                        Ok((tx, false))
                    }
                    _ => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn history(
        &self,
        wallet_id: Uuid,
        page: PageRequest,
    ) -> Result<HistoryPage, WalletError> {
        self.store.get_history(wallet_id, page).await
    }
}
