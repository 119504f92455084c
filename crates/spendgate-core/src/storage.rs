use crate::error::SpendGateError;
use crate::ledger::{LedgerEntry, LedgerEntryKind, WalletLedger};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

/// Ledger persistence backend configuration.
#[derive(Debug, Clone)]
pub enum LedgerStorageConfig {
    /// Keep all wallet ledger entries in process memory only.
    Memory,
    /// Persist all entries in PostgreSQL and hydrate ledger state on startup.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl LedgerStorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

impl Default for LedgerStorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

#[derive(Debug, Clone)]
enum LedgerStorageBackend {
    Memory,
    Postgres(PostgresLedgerStore),
}

/// Runtime ledger wrapper that keeps an in-memory authoritative chain while
/// optionally mirroring each entry to PostgreSQL.
///
/// Invariant handling:
/// - Entry hash/index is computed against the in-memory chain first.
/// - Entry is persisted before it is committed in-memory.
/// - On startup, PostgreSQL entries are hydrated and hash-verified.
#[derive(Debug, Clone)]
pub struct PersistentLedger {
    ledger: WalletLedger,
    backend: LedgerStorageBackend,
}

impl PersistentLedger {
    /// Build an in-memory persistent ledger from already persisted entries.
    pub fn from_entries(entries: Vec<LedgerEntry>) -> Result<Self, SpendGateError> {
        Ok(Self {
            ledger: WalletLedger::from_entries(entries)?,
            backend: LedgerStorageBackend::Memory,
        })
    }

    pub async fn bootstrap(config: LedgerStorageConfig) -> Result<Self, SpendGateError> {
        match config {
            LedgerStorageConfig::Memory => Ok(Self {
                ledger: WalletLedger::new(),
                backend: LedgerStorageBackend::Memory,
            }),
            LedgerStorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PostgresLedgerStore::connect(&database_url, max_connections).await?;
                store.ensure_schema().await?;
                let entries = store.load_entries().await?;
                let ledger = WalletLedger::from_entries(entries)?;
                Ok(Self {
                    ledger,
                    backend: LedgerStorageBackend::Postgres(store),
                })
            }
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self.backend {
            LedgerStorageBackend::Memory => "memory",
            LedgerStorageBackend::Postgres(_) => "postgres",
        }
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        self.ledger.entries()
    }

    pub fn entries_for_user(&self, user_id: &str) -> Vec<LedgerEntry> {
        self.ledger.entries_for_user(user_id)
    }

    pub fn replay_balance(&self, user_id: &str) -> i64 {
        self.ledger.replay_balance(user_id)
    }

    pub fn verify_chain(&self) -> bool {
        self.ledger.verify_chain()
    }

    pub async fn append(
        &mut self,
        user_id: &str,
        kind: LedgerEntryKind,
        transaction_id: Option<String>,
        amount_minor: i64,
        balance_after_minor: i64,
    ) -> Result<LedgerEntry, SpendGateError> {
        let entry = self.ledger.build_entry(
            user_id,
            kind,
            transaction_id,
            amount_minor,
            balance_after_minor,
        );

        if let LedgerStorageBackend::Postgres(store) = &self.backend {
            store.insert_entry(&entry).await?;
        }

        self.ledger.commit_entry(entry.clone())?;
        Ok(entry)
    }
}

#[derive(Debug, Clone)]
struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    async fn connect(database_url: &str, max_connections: u32) -> Result<Self, SpendGateError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| SpendGateError::Ledger(format!("postgres connect failed: {e}")))?;

        Ok(Self { pool })
    }

    async fn ensure_schema(&self) -> Result<(), SpendGateError> {
        // Single append-only table; the application controls deterministic
        // index/hash generation.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_ledger_entries (
                ledger_index BIGINT PRIMARY KEY,
                entry_id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                transaction_id TEXT NULL,
                amount_minor BIGINT NOT NULL,
                balance_after_minor BIGINT NOT NULL,
                entry_timestamp TIMESTAMPTZ NOT NULL,
                previous_hash TEXT NULL,
                entry_hash TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SpendGateError::Ledger(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_wallet_ledger_user_id ON wallet_ledger_entries (user_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SpendGateError::Ledger(format!("postgres index create failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_wallet_ledger_transaction_id ON wallet_ledger_entries (transaction_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SpendGateError::Ledger(format!("postgres index create failed: {e}")))?;

        Ok(())
    }

    async fn load_entries(&self) -> Result<Vec<LedgerEntry>, SpendGateError> {
        let rows = sqlx::query(
            r#"
            SELECT
                ledger_index,
                entry_id,
                user_id,
                kind,
                transaction_id,
                amount_minor,
                balance_after_minor,
                entry_timestamp,
                previous_hash,
                entry_hash
            FROM wallet_ledger_entries
            ORDER BY ledger_index ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SpendGateError::Ledger(format!("postgres load failed: {e}")))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let kind_str: String = row
                .try_get("kind")
                .map_err(|e| SpendGateError::Ledger(format!("postgres decode kind failed: {e}")))?;
            let kind = LedgerEntryKind::parse(&kind_str)?;

            let index: i64 = row.try_get("ledger_index").map_err(|e| {
                SpendGateError::Ledger(format!("postgres decode ledger_index failed: {e}"))
            })?;

            entries.push(LedgerEntry {
                entry_id: row.try_get("entry_id").map_err(|e| {
                    SpendGateError::Ledger(format!("postgres decode entry_id failed: {e}"))
                })?,
                index: index.try_into().map_err(|_| {
                    SpendGateError::Ledger("negative ledger index in storage".to_string())
                })?,
                user_id: row.try_get("user_id").map_err(|e| {
                    SpendGateError::Ledger(format!("postgres decode user_id failed: {e}"))
                })?,
                kind,
                transaction_id: row.try_get("transaction_id").map_err(|e| {
                    SpendGateError::Ledger(format!("postgres decode transaction_id failed: {e}"))
                })?,
                amount_minor: row.try_get("amount_minor").map_err(|e| {
                    SpendGateError::Ledger(format!("postgres decode amount_minor failed: {e}"))
                })?,
                balance_after_minor: row.try_get("balance_after_minor").map_err(|e| {
                    SpendGateError::Ledger(format!(
                        "postgres decode balance_after_minor failed: {e}"
                    ))
                })?,
                timestamp: row.try_get("entry_timestamp").map_err(|e| {
                    SpendGateError::Ledger(format!("postgres decode entry_timestamp failed: {e}"))
                })?,
                previous_hash: row.try_get("previous_hash").map_err(|e| {
                    SpendGateError::Ledger(format!("postgres decode previous_hash failed: {e}"))
                })?,
                entry_hash: row.try_get("entry_hash").map_err(|e| {
                    SpendGateError::Ledger(format!("postgres decode entry_hash failed: {e}"))
                })?,
            });
        }

        Ok(entries)
    }

    async fn insert_entry(&self, entry: &LedgerEntry) -> Result<(), SpendGateError> {
        let index: i64 = entry.index.try_into().map_err(|_| {
            SpendGateError::Ledger("ledger index exceeds postgres BIGINT range".to_string())
        })?;
        sqlx::query(
            r#"
            INSERT INTO wallet_ledger_entries (
                ledger_index,
                entry_id,
                user_id,
                kind,
                transaction_id,
                amount_minor,
                balance_after_minor,
                entry_timestamp,
                previous_hash,
                entry_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(index)
        .bind(&entry.entry_id)
        .bind(&entry.user_id)
        .bind(entry.kind.as_str())
        .bind(&entry.transaction_id)
        .bind(entry.amount_minor)
        .bind(entry.balance_after_minor)
        .bind(entry.timestamp)
        .bind(&entry.previous_hash)
        .bind(&entry.entry_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| SpendGateError::Ledger(format!("postgres insert failed: {e}")))?;

        Ok(())
    }
}
