//! GL account mappings.
//!
//! Per-tenant tables map sub-departments, payment types and tax groups to
//! accounts. [`MappingResolver`] reads them through the posting transaction
//! and caches lookups in a [`MappingCache`] owned by the engine;
//! [`MappingStore`] writes them and calls the invalidation hook it was built
//! with so cached lookups never outlive a change made through it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CommandError;
use crate::storage::schema::{
    GlAccounts, GlPaymentTypeMappings, GlSettings, GlSubdepartmentMappings, GlTaxGroupMappings,
    GlUnmappedEvents,
};
use crate::storage::{now_rfc3339, StorageError, TenantId, TenantTx};

use super::{period_id_for, UnmappedMapping};

/// Which account of which mapping table a lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingKind {
    SubDepartmentRevenue,
    SubDepartmentCogs,
    SubDepartmentInventory,
    PaymentTypeClearing,
    PaymentTypeFee,
    TaxGroupPayable,
}

impl MappingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingKind::SubDepartmentRevenue => "sub_department.revenue",
            MappingKind::SubDepartmentCogs => "sub_department.cogs",
            MappingKind::SubDepartmentInventory => "sub_department.inventory",
            MappingKind::PaymentTypeClearing => "payment_type.clearing",
            MappingKind::PaymentTypeFee => "payment_type.fee",
            MappingKind::TaxGroupPayable => "tax_group.payable",
        }
    }
}

/// Which side of an account's activity is its natural balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalBalance {
    Debit,
    Credit,
}

impl NormalBalance {
    pub fn as_str(&self) -> &'static str {
        match self {
            NormalBalance::Debit => "debit",
            NormalBalance::Credit => "credit",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self, StorageError> {
        match value {
            "debit" => Ok(NormalBalance::Debit),
            "credit" => Ok(NormalBalance::Credit),
            other => Err(StorageError::InvalidValue {
                table: "gl_accounts",
                column: "normal_balance",
                value: other.to_string(),
            }),
        }
    }
}

/// Chart-of-accounts entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlAccount {
    pub account_id: String,
    pub name: String,
    pub normal_balance: NormalBalance,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubDepartmentMapping {
    pub sub_department_id: String,
    pub revenue_account_id: Option<String>,
    pub cogs_account_id: Option<String>,
    pub inventory_account_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTypeMapping {
    pub payment_type: String,
    pub cash_account_id: Option<String>,
    pub clearing_account_id: Option<String>,
    pub fee_account_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxGroupMapping {
    pub tax_group_id: String,
    pub payable_account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Mapping(TenantId, MappingKind, String),
    Fallback(TenantId),
}

impl CacheKey {
    fn tenant(&self) -> &TenantId {
        match self {
            CacheKey::Mapping(tenant, _, _) | CacheKey::Fallback(tenant) => tenant,
        }
    }
}

/// TTL cache of mapping lookups, including misses.
pub struct MappingCache {
    ttl: Duration,
    entries: RwLock<HashMap<CacheKey, (Instant, Option<String>)>>,
}

impl MappingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, key: &CacheKey) -> Option<Option<String>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, value)| value.clone())
    }

    fn put(&self, key: CacheKey, value: Option<String>) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, (Instant::now(), value));
    }

    /// Drop every cached lookup of `tenant`.
    pub fn invalidate_tenant(&self, tenant: &TenantId) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|key, _| key.tenant() != tenant);
        debug!(tenant_id = %tenant, "Mapping cache invalidated");
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves mappings through a tenant transaction, falling back to the unmapped account.
pub struct MappingResolver {
    cache: Arc<MappingCache>,
    default_unmapped_account: String,
}

/// Where a source document came from, for the unmapped-event log.
pub(crate) struct SourceRef<'a> {
    pub module: &'a str,
    pub reference_id: &'a str,
    pub business_date: NaiveDate,
}

impl MappingResolver {
    pub fn new(cache: Arc<MappingCache>, default_unmapped_account: impl Into<String>) -> Self {
        Self {
            cache,
            default_unmapped_account: default_unmapped_account.into(),
        }
    }

    pub fn cache(&self) -> &Arc<MappingCache> {
        &self.cache
    }

    /// Mapped account for (`kind`, `key`), if configured.
    pub async fn lookup(
        &self,
        tx: &mut TenantTx<'_>,
        kind: MappingKind,
        key: &str,
    ) -> Result<Option<String>, StorageError> {
        let cache_key = CacheKey::Mapping(tx.tenant().clone(), kind, key.to_string());
        if let Some(hit) = self.cache.get(&cache_key) {
            return Ok(hit);
        }

        let tenant = tx.tenant().to_string();
        let select = match kind {
            MappingKind::SubDepartmentRevenue
            | MappingKind::SubDepartmentCogs
            | MappingKind::SubDepartmentInventory => {
                let column = match kind {
                    MappingKind::SubDepartmentRevenue => GlSubdepartmentMappings::RevenueAccountId,
                    MappingKind::SubDepartmentCogs => GlSubdepartmentMappings::CogsAccountId,
                    _ => GlSubdepartmentMappings::InventoryAccountId,
                };
                Query::select()
                    .expr_as(Expr::col(column), AccountAlias)
                    .from(GlSubdepartmentMappings::Table)
                    .and_where(Expr::col(GlSubdepartmentMappings::TenantId).eq(tenant))
                    .and_where(Expr::col(GlSubdepartmentMappings::SubDepartmentId).eq(key))
                    .to_string(SqliteQueryBuilder)
            }
            MappingKind::PaymentTypeClearing => Query::select()
                .expr_as(
                    Expr::cust("COALESCE(clearing_account_id, cash_account_id)"),
                    AccountAlias,
                )
                .from(GlPaymentTypeMappings::Table)
                .and_where(Expr::col(GlPaymentTypeMappings::TenantId).eq(tenant))
                .and_where(Expr::col(GlPaymentTypeMappings::PaymentType).eq(key))
                .to_string(SqliteQueryBuilder),
            MappingKind::PaymentTypeFee => Query::select()
                .expr_as(Expr::col(GlPaymentTypeMappings::FeeAccountId), AccountAlias)
                .from(GlPaymentTypeMappings::Table)
                .and_where(Expr::col(GlPaymentTypeMappings::TenantId).eq(tenant))
                .and_where(Expr::col(GlPaymentTypeMappings::PaymentType).eq(key))
                .to_string(SqliteQueryBuilder),
            MappingKind::TaxGroupPayable => Query::select()
                .expr_as(Expr::col(GlTaxGroupMappings::PayableAccountId), AccountAlias)
                .from(GlTaxGroupMappings::Table)
                .and_where(Expr::col(GlTaxGroupMappings::TenantId).eq(tenant))
                .and_where(Expr::col(GlTaxGroupMappings::TaxGroupId).eq(key))
                .to_string(SqliteQueryBuilder),
        };

        let account = match tx.fetch_optional(&select).await? {
            Some(row) => row.try_get::<Option<String>, _>("account_id")?,
            None => None,
        };
        self.cache.put(cache_key, account.clone());
        Ok(account)
    }

    /// The tenant's unmapped account, or the configured default.
    pub async fn fallback_account(&self, tx: &mut TenantTx<'_>) -> Result<String, StorageError> {
        let cache_key = CacheKey::Fallback(tx.tenant().clone());
        let configured = match self.cache.get(&cache_key) {
            Some(hit) => hit,
            None => {
                let select = Query::select()
                    .column(GlSettings::UnmappedAccountId)
                    .from(GlSettings::Table)
                    .and_where(Expr::col(GlSettings::TenantId).eq(tx.tenant().as_str()))
                    .to_string(SqliteQueryBuilder);
                let account = match tx.fetch_optional(&select).await? {
                    Some(row) => row.try_get::<Option<String>, _>("unmapped_account_id")?,
                    None => None,
                };
                self.cache.put(cache_key, account.clone());
                account
            }
        };
        Ok(configured.unwrap_or_else(|| self.default_unmapped_account.clone()))
    }

    /// Mapped account, or the fallback account noted in `unmapped`.
    ///
    /// A missing mapping never fails the posting. Nothing is written here;
    /// the caller records `unmapped` once the entry is known to post.
    pub(crate) async fn resolve(
        &self,
        tx: &mut TenantTx<'_>,
        kind: MappingKind,
        key: &str,
        unmapped: &mut Vec<UnmappedMapping>,
    ) -> Result<String, StorageError> {
        if let Some(account) = self.lookup(tx, kind, key).await? {
            return Ok(account);
        }

        let fallback = self.fallback_account(tx).await?;
        let already_noted = unmapped
            .iter()
            .any(|u| u.mapping_kind == kind.as_str() && u.mapping_key == key);
        if !already_noted {
            unmapped.push(UnmappedMapping {
                mapping_kind: kind.as_str().to_string(),
                mapping_key: key.to_string(),
                fallback_account_id: fallback.clone(),
            });
        }
        Ok(fallback)
    }
}

#[derive(sea_query::Iden)]
#[iden = "account_id"]
struct AccountAlias;

/// Log every fallback used by a posted entry, once per (kind, key).
pub(crate) async fn record_unmapped(
    tx: &mut TenantTx<'_>,
    source: &SourceRef<'_>,
    unmapped: &[UnmappedMapping],
) -> Result<(), StorageError> {
    let tenant = tx.tenant().to_string();

    for mapping in unmapped {
        let insert = Query::insert()
            .into_table(GlUnmappedEvents::Table)
            .columns([
                GlUnmappedEvents::Id,
                GlUnmappedEvents::TenantId,
                GlUnmappedEvents::SourceModule,
                GlUnmappedEvents::SourceReferenceId,
                GlUnmappedEvents::MappingKind,
                GlUnmappedEvents::MappingKey,
                GlUnmappedEvents::FallbackAccountId,
                GlUnmappedEvents::BusinessDate,
                GlUnmappedEvents::PeriodId,
                GlUnmappedEvents::CreatedAt,
            ])
            .values_panic([
                Uuid::new_v4().to_string().into(),
                tenant.clone().into(),
                source.module.into(),
                source.reference_id.into(),
                mapping.mapping_kind.as_str().into(),
                mapping.mapping_key.as_str().into(),
                mapping.fallback_account_id.as_str().into(),
                source.business_date.to_string().into(),
                period_id_for(source.business_date).into(),
                now_rfc3339().into(),
            ])
            .on_conflict(
                OnConflict::columns([
                    GlUnmappedEvents::TenantId,
                    GlUnmappedEvents::SourceModule,
                    GlUnmappedEvents::SourceReferenceId,
                    GlUnmappedEvents::MappingKind,
                    GlUnmappedEvents::MappingKey,
                ])
                .do_nothing()
                .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        tx.execute(&insert).await?;

        warn!(
            tenant_id = %tenant,
            source_module = source.module,
            source_reference_id = source.reference_id,
            mapping_kind = %mapping.mapping_kind,
            mapping_key = %mapping.mapping_key,
            fallback_account_id = %mapping.fallback_account_id,
            "GL mapping missing, posted to unmapped account"
        );
    }
    Ok(())
}

/// Hook called after a tenant's mappings change.
pub type InvalidateFn = Arc<dyn Fn(&TenantId) + Send + Sync>;

/// Writes mapping configuration and the chart of accounts.
pub struct MappingStore {
    pool: SqlitePool,
    invalidate: InvalidateFn,
}

impl MappingStore {
    pub fn new(pool: SqlitePool, invalidate: InvalidateFn) -> Self {
        Self { pool, invalidate }
    }

    async fn write(&self, tenant: &TenantId, sql: String) -> Result<(), CommandError> {
        let mut tx = TenantTx::begin(&self.pool, tenant.clone()).await?;
        tx.execute(&sql).await?;
        tx.commit().await?;
        (self.invalidate)(tenant);
        Ok(())
    }

    pub async fn upsert_sub_department(
        &self,
        tenant: &TenantId,
        mapping: &SubDepartmentMapping,
    ) -> Result<(), CommandError> {
        if mapping.sub_department_id.trim().is_empty() {
            return Err(CommandError::validation("sub-department id is required"));
        }
        let sql = Query::insert()
            .into_table(GlSubdepartmentMappings::Table)
            .columns([
                GlSubdepartmentMappings::TenantId,
                GlSubdepartmentMappings::SubDepartmentId,
                GlSubdepartmentMappings::RevenueAccountId,
                GlSubdepartmentMappings::CogsAccountId,
                GlSubdepartmentMappings::InventoryAccountId,
            ])
            .values_panic([
                tenant.as_str().into(),
                mapping.sub_department_id.clone().into(),
                mapping.revenue_account_id.clone().into(),
                mapping.cogs_account_id.clone().into(),
                mapping.inventory_account_id.clone().into(),
            ])
            .on_conflict(
                OnConflict::columns([
                    GlSubdepartmentMappings::TenantId,
                    GlSubdepartmentMappings::SubDepartmentId,
                ])
                .update_columns([
                    GlSubdepartmentMappings::RevenueAccountId,
                    GlSubdepartmentMappings::CogsAccountId,
                    GlSubdepartmentMappings::InventoryAccountId,
                ])
                .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        self.write(tenant, sql).await
    }

    pub async fn upsert_payment_type(
        &self,
        tenant: &TenantId,
        mapping: &PaymentTypeMapping,
    ) -> Result<(), CommandError> {
        if mapping.payment_type.trim().is_empty() {
            return Err(CommandError::validation("payment type is required"));
        }
        let sql = Query::insert()
            .into_table(GlPaymentTypeMappings::Table)
            .columns([
                GlPaymentTypeMappings::TenantId,
                GlPaymentTypeMappings::PaymentType,
                GlPaymentTypeMappings::CashAccountId,
                GlPaymentTypeMappings::ClearingAccountId,
                GlPaymentTypeMappings::FeeAccountId,
            ])
            .values_panic([
                tenant.as_str().into(),
                mapping.payment_type.clone().into(),
                mapping.cash_account_id.clone().into(),
                mapping.clearing_account_id.clone().into(),
                mapping.fee_account_id.clone().into(),
            ])
            .on_conflict(
                OnConflict::columns([
                    GlPaymentTypeMappings::TenantId,
                    GlPaymentTypeMappings::PaymentType,
                ])
                .update_columns([
                    GlPaymentTypeMappings::CashAccountId,
                    GlPaymentTypeMappings::ClearingAccountId,
                    GlPaymentTypeMappings::FeeAccountId,
                ])
                .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        self.write(tenant, sql).await
    }

    pub async fn upsert_tax_group(
        &self,
        tenant: &TenantId,
        mapping: &TaxGroupMapping,
    ) -> Result<(), CommandError> {
        if mapping.tax_group_id.trim().is_empty() {
            return Err(CommandError::validation("tax group id is required"));
        }
        let sql = Query::insert()
            .into_table(GlTaxGroupMappings::Table)
            .columns([
                GlTaxGroupMappings::TenantId,
                GlTaxGroupMappings::TaxGroupId,
                GlTaxGroupMappings::PayableAccountId,
            ])
            .values_panic([
                tenant.as_str().into(),
                mapping.tax_group_id.clone().into(),
                mapping.payable_account_id.clone().into(),
            ])
            .on_conflict(
                OnConflict::columns([GlTaxGroupMappings::TenantId, GlTaxGroupMappings::TaxGroupId])
                    .update_column(GlTaxGroupMappings::PayableAccountId)
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        self.write(tenant, sql).await
    }

    /// Set (or clear) the tenant's unmapped account.
    pub async fn set_unmapped_account(
        &self,
        tenant: &TenantId,
        account_id: Option<&str>,
    ) -> Result<(), CommandError> {
        let sql = Query::insert()
            .into_table(GlSettings::Table)
            .columns([GlSettings::TenantId, GlSettings::UnmappedAccountId])
            .values_panic([tenant.as_str().into(), account_id.map(str::to_string).into()])
            .on_conflict(
                OnConflict::column(GlSettings::TenantId)
                    .update_column(GlSettings::UnmappedAccountId)
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        self.write(tenant, sql).await
    }

    pub async fn upsert_account(
        &self,
        tenant: &TenantId,
        account: &GlAccount,
    ) -> Result<(), CommandError> {
        if account.account_id.trim().is_empty() {
            return Err(CommandError::validation("account id is required"));
        }
        let sql = Query::insert()
            .into_table(GlAccounts::Table)
            .columns([
                GlAccounts::TenantId,
                GlAccounts::AccountId,
                GlAccounts::Name,
                GlAccounts::NormalBalance,
            ])
            .values_panic([
                tenant.as_str().into(),
                account.account_id.clone().into(),
                account.name.clone().into(),
                account.normal_balance.as_str().into(),
            ])
            .on_conflict(
                OnConflict::columns([GlAccounts::TenantId, GlAccounts::AccountId])
                    .update_columns([GlAccounts::Name, GlAccounts::NormalBalance])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        self.write(tenant, sql).await
    }
}

/// Normal balance of `account_id`, if it is in the tenant's chart of accounts.
pub async fn account_normal_balance(
    tx: &mut TenantTx<'_>,
    account_id: &str,
) -> Result<Option<NormalBalance>, StorageError> {
    let select = Query::select()
        .column(GlAccounts::NormalBalance)
        .from(GlAccounts::Table)
        .and_where(Expr::col(GlAccounts::TenantId).eq(tx.tenant().as_str()))
        .and_where(Expr::col(GlAccounts::AccountId).eq(account_id))
        .to_string(SqliteQueryBuilder);

    match tx.fetch_optional(&select).await? {
        Some(row) => {
            let value: String = row.try_get("normal_balance")?;
            Ok(Some(NormalBalance::parse(&value)?))
        }
        None => Ok(None),
    }
}
