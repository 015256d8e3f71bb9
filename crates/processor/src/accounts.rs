//! Account management: creation with federation name claims, updates, and
//! guarded deletion.

use crate::error::{registry_error, ProcessorResult};
use crate::Processor;
use keppel_core::audit::{AuditAction, AuditEvent};
use keppel_core::federation::ClaimResult;
use keppel_core::reference::validate_account_name;
use keppel_core::{AuthDriver, FederationDriver, RegistryErrorCode};
use keppel_metadata::models::AccountRow;
use keppel_metadata::repos::{AccountRepo, BlobRepo, RepoRepo};
use keppel_storage::StorageDriver as _;

impl Processor {
    /// Create an account (claiming its name with the federation) or update
    /// the mutable attributes of an existing one. The auth tenant of an
    /// account can never change.
    pub async fn create_or_update_account(
        &self,
        desired: AccountRow,
        sublease_token: Option<&str>,
        auth: &dyn AuthDriver,
        federation: &dyn FederationDriver,
    ) -> ProcessorResult<AccountRow> {
        crate::metrics::observe("create_or_update_account", async {
            validate_account_name(&desired.name)?;
            auth.validate_tenant_id(&desired.auth_tenant_id)
                .await
                .map_err(|err| registry_error(RegistryErrorCode::NameInvalid, err.to_string()))?;
            desired
                .gc_policies()
                .map_err(|err| registry_error(RegistryErrorCode::NameInvalid, err.to_string()))?;
            desired
                .platform_filter()
                .map_err(|err| registry_error(RegistryErrorCode::NameInvalid, err.to_string()))?;

            match self.db().get_account(&desired.name).await? {
                Some(existing) => {
                    if existing.auth_tenant_id != desired.auth_tenant_id {
                        return Err(registry_error(
                            RegistryErrorCode::Denied,
                            "account belongs to a different auth tenant",
                        ));
                    }
                    self.db().update_account(&desired).await?;
                    self.record_account_event(&desired, AuditAction::Update);
                    Ok(desired)
                }
                None => {
                    let claim = federation
                        .claim_account_name(&desired.name, &desired.auth_tenant_id, sublease_token)
                        .await
                        .map_err(|err| registry_error(RegistryErrorCode::Denied, err.to_string()))?;
                    if let ClaimResult::Denied(reason) = claim {
                        return Err(registry_error(
                            RegistryErrorCode::Denied,
                            format!("account name is not available: {reason}"),
                        ));
                    }
                    self.db().create_account(&desired).await?;
                    self.record_account_event(&desired, AuditAction::Create);
                    Ok(desired)
                }
            }
        })
        .await
    }

    /// Delete an empty account: refuse while repos or blobs remain, then
    /// clean up storage, forfeit the federation claim, and drop the row.
    pub async fn delete_account(
        &self,
        account: &AccountRow,
        federation: &dyn FederationDriver,
    ) -> ProcessorResult<()> {
        crate::metrics::observe("delete_account", async {
            let repos = self.db().list_repos(&account.name, None, 1).await?;
            if !repos.is_empty() {
                return Err(registry_error(
                    RegistryErrorCode::Denied,
                    format!("account still contains repository {}", repos[0].name),
                ));
            }
            let blobs = self.db().list_blob_storage_ids(&account.name).await?;
            if !blobs.is_empty() {
                return Err(registry_error(
                    RegistryErrorCode::Denied,
                    "account still contains blobs",
                ));
            }

            self.storage().cleanup_account(&account.scope()).await?;
            if let Err(err) = federation.forfeit_account_name(&account.name).await {
                tracing::error!(account = %account.name, "could not forfeit account name: {err}");
            }
            self.db().delete_account(&account.name).await?;
            self.record_account_event(account, AuditAction::Delete);
            Ok(())
        })
        .await
    }

    fn record_account_event(&self, account: &AccountRow, action: AuditAction) {
        self.auditor().record(AuditEvent {
            observed_at: self.now(),
            user_name: String::new(),
            action,
            account: account.name.clone(),
            repository: None,
            target_type: "account",
            target_id: account.name.clone(),
        });
    }
}
