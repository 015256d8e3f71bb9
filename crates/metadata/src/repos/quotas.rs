//! Quota repository.

use crate::error::MetadataResult;
use crate::models::QuotaRow;
use async_trait::async_trait;

/// Repository for per-auth-tenant quotas. A tenant without a quota row has
/// a manifest limit of zero; an operator must grant quota before the first
/// push.
#[async_trait]
pub trait QuotaRepo: Send + Sync {
    async fn get_quota(&self, auth_tenant_id: &str) -> MetadataResult<Option<QuotaRow>>;

    async fn set_quota(&self, quota: &QuotaRow) -> MetadataResult<()>;
}
