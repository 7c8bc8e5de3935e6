/// PostgreSQL transaction store
///
/// Each `transition` runs in one database transaction: the row is taken
/// with FOR UPDATE, validated against the expected state and version in
/// Rust, rewritten, and the ledger event inserted before commit. The row
/// lock doubles as the multi-node per-transaction serialisation point.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sambaza_errors::{BridgeError, Result};
use sambaza_types::{
    ClientOrigin, EventKind, Failure, Flow, KesAmount, LightningInvoice, Msisdn, MpesaReceipt,
    PaymentHash, Receipt, SatAmount, Transaction, TransactionEvent, TransactionId, TxState,
};
use sqlx::{postgres::PgRow, PgPool, Postgres, Row};

use super::{Transition, TransactionStore};

pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_transaction(row: &PgRow) -> Result<Transaction> {
        let failure = match row.get::<Option<String>, _>("failure_reason") {
            Some(reason) => Some(Failure {
                reason: reason.parse().map_err(|e: String| BridgeError::InvariantViolation {
                    message: e,
                })?,
                detail: row.get::<Option<String>, _>("failure_detail").unwrap_or_default(),
            }),
            None => None,
        };

        let payment_hash = PaymentHash::parse(&row.get::<String, _>("payment_hash"))
            .map_err(|e| BridgeError::InvariantViolation { message: e })?;
        let recipient_phone = Msisdn::raw(row.get::<String, _>("recipient_phone"));

        Ok(Transaction {
            id: row.get("id"),
            flow: row.get("flow"),
            payment_hash,
            recipient_phone,
            merchant_code: row.get("merchant_code"),
            account_number: row.get("account_number"),
            kes_amount: KesAmount::from_cents(row.get::<i64, _>("kes_amount")),
            btc_amount: SatAmount::new(row.get::<i64, _>("btc_amount")),
            rate: row.get("rate"),
            fee_kes: KesAmount::from_cents(row.get::<i64, _>("fee_kes")),
            state: row.get("state"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            quote_expires_at: row.get("quote_expires_at"),
            lightning_invoice: row
                .get::<Option<String>, _>("lightning_invoice")
                .map(LightningInvoice),
            settled_at: row.get("settled_at"),
            mpesa_receipt: row.get::<Option<String>, _>("mpesa_receipt").map(MpesaReceipt),
            provider_conversation_id: row.get("provider_conversation_id"),
            failure,
            risk_score: row.get("risk_score"),
            idempotency_key: row.get("idempotency_key"),
            origin: ClientOrigin {
                source_ip: row.get("source_ip"),
                user_agent: row.get("user_agent"),
            },
            version: row.get("version"),
        })
    }

    async fn fetch_one_where(&self, clause: &str, bind: &str) -> Result<Transaction> {
        let query = format!("SELECT * FROM transactions WHERE {clause}");
        let row = sqlx::query(&query)
            .bind(bind)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BridgeError::NotFound)?;
        Self::row_to_transaction(&row)
    }

    async fn insert_row<'e, E>(executor: E, tx: &Transaction) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, flow, payment_hash, recipient_phone, merchant_code,
                account_number, kes_amount, btc_amount, rate, fee_kes, state,
                created_at, updated_at, quote_expires_at, lightning_invoice,
                settled_at, mpesa_receipt, provider_conversation_id,
                failure_reason, failure_detail, risk_score, idempotency_key,
                source_ip, user_agent, version
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25
            )
            "#,
        )
        .bind(tx.id)
        .bind(tx.flow)
        .bind(tx.payment_hash.as_str())
        .bind(tx.recipient_phone.as_str())
        .bind(&tx.merchant_code)
        .bind(&tx.account_number)
        .bind(tx.kes_amount.cents())
        .bind(tx.btc_amount.sats())
        .bind(tx.rate)
        .bind(tx.fee_kes.cents())
        .bind(tx.state)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .bind(tx.quote_expires_at)
        .bind(tx.lightning_invoice.as_ref().map(|i| i.0.as_str()))
        .bind(tx.settled_at)
        .bind(tx.mpesa_receipt.as_ref().map(|r| r.0.as_str()))
        .bind(&tx.provider_conversation_id)
        .bind(tx.failure.as_ref().map(|f| f.reason.as_str()))
        .bind(tx.failure.as_ref().map(|f| f.detail.as_str()))
        .bind(tx.risk_score)
        .bind(&tx.idempotency_key)
        .bind(&tx.origin.source_ip)
        .bind(&tx.origin.user_agent)
        .bind(tx.version)
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn append_event_in<'e, E>(
        executor: E,
        tx_id: TransactionId,
        kind: &EventKind,
        at: DateTime<Utc>,
        state: TxState,
    ) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let kind_json = serde_json::to_value(kind)
            .map_err(|e| BridgeError::Internal(anyhow::Error::new(e)))?;
        sqlx::query(
            r#"
            INSERT INTO transaction_events (tx_id, seq, kind, at, state)
            SELECT $1, COALESCE(MAX(seq) + 1, 0), $2, $3, $4
            FROM transaction_events WHERE tx_id = $1
            "#,
        )
        .bind(tx_id)
        .bind(kind_json)
        .bind(at)
        .bind(state)
        .execute(executor)
        .await?;
        Ok(())
    }

    fn map_unique_violation(err: sqlx::Error, existing: Option<TransactionId>) -> BridgeError {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.constraint() == Some("idx_transactions_payment_hash") {
                return BridgeError::DuplicatePaymentHash;
            }
            if db_err.constraint() == Some("idx_transactions_flow_idempotency_key") {
                if let Some(id) = existing {
                    return BridgeError::DuplicateIdempotencyKey { existing: id };
                }
            }
        }
        BridgeError::Database(err)
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn create(&self, tx: Transaction) -> Result<Transaction> {
        let mut db_tx = self.pool.begin().await?;

        if let Err(err) = Self::insert_row(&mut *db_tx, &tx).await {
            db_tx.rollback().await.ok();
            // Resolve the winning id for an idempotency collision so the
            // caller can converge on it.
            let existing = match (&err, &tx.idempotency_key) {
                (BridgeError::Database(_), Some(key)) => {
                    self.find_by_idempotency_key(tx.flow, key).await?.map(|t| t.id)
                }
                _ => None,
            };
            return Err(match err {
                BridgeError::Database(db) => Self::map_unique_violation(db, existing),
                other => other,
            });
        }

        Self::append_event_in(&mut *db_tx, tx.id, &EventKind::Created, tx.created_at, tx.state)
            .await?;
        db_tx.commit().await?;

        Ok(tx)
    }

    async fn get(&self, id: TransactionId) -> Result<Transaction> {
        let row = sqlx::query("SELECT * FROM transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BridgeError::NotFound)?;
        Self::row_to_transaction(&row)
    }

    async fn get_by_payment_hash(&self, hash: &PaymentHash) -> Result<Transaction> {
        self.fetch_one_where("payment_hash = $1", hash.as_str()).await
    }

    async fn get_by_payment_hash_prefix(&self, prefix: &str) -> Result<Transaction> {
        // Refuse anything that is not plain hex; the prefix reaches us from
        // an external callback body.
        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BridgeError::NotFound);
        }
        let rows = sqlx::query("SELECT * FROM transactions WHERE payment_hash LIKE $1 || '%' LIMIT 2")
            .bind(prefix.to_ascii_lowercase())
            .fetch_all(&self.pool)
            .await?;
        if rows.len() != 1 {
            return Err(BridgeError::NotFound);
        }
        Self::row_to_transaction(&rows[0])
    }

    async fn get_by_conversation_id(&self, conversation_id: &str) -> Result<Transaction> {
        self.fetch_one_where("provider_conversation_id = $1", conversation_id).await
    }

    async fn find_by_idempotency_key(&self, flow: Flow, key: &str) -> Result<Option<Transaction>> {
        let row = sqlx::query(
            "SELECT * FROM transactions WHERE flow = $1 AND idempotency_key = $2",
        )
        .bind(flow)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::row_to_transaction(&r)).transpose()
    }

    async fn transition(&self, transition: Transition) -> Result<Transaction> {
        let mut db_tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM transactions WHERE id = $1 FOR UPDATE")
            .bind(transition.id)
            .fetch_optional(&mut *db_tx)
            .await?
            .ok_or(BridgeError::NotFound)?;
        let current = Self::row_to_transaction(&row)?;

        if current.version != transition.expected_version
            || current.state != transition.expected_state
        {
            return Err(BridgeError::StaleVersion { id: transition.id });
        }

        if !current.state.can_transition_to(transition.new_state) {
            return Err(BridgeError::IllegalTransition {
                id: transition.id,
                from: current.state,
                to: transition.new_state,
            });
        }

        let mut updated = current;
        if let Some(mutate) = transition.mutate {
            mutate(&mut updated);
        }
        updated.state = transition.new_state;
        updated.updated_at = transition.at;
        updated.version += 1;

        let has_receipt = updated.mpesa_receipt.is_some();
        if has_receipt != (updated.state == TxState::Completed) {
            return Err(BridgeError::InvariantViolation {
                message: format!(
                    "mpesa_receipt presence ({has_receipt}) does not match state {}",
                    updated.state
                ),
            });
        }

        sqlx::query(
            r#"
            UPDATE transactions SET
                state = $2, updated_at = $3, lightning_invoice = $4,
                settled_at = $5, mpesa_receipt = $6,
                provider_conversation_id = $7, failure_reason = $8,
                failure_detail = $9, risk_score = $10, version = $11
            WHERE id = $1
            "#,
        )
        .bind(updated.id)
        .bind(updated.state)
        .bind(updated.updated_at)
        .bind(updated.lightning_invoice.as_ref().map(|i| i.0.as_str()))
        .bind(updated.settled_at)
        .bind(updated.mpesa_receipt.as_ref().map(|r| r.0.as_str()))
        .bind(&updated.provider_conversation_id)
        .bind(updated.failure.as_ref().map(|f| f.reason.as_str()))
        .bind(updated.failure.as_ref().map(|f| f.detail.as_str()))
        .bind(updated.risk_score)
        .bind(updated.version)
        .execute(&mut *db_tx)
        .await?;

        Self::append_event_in(
            &mut *db_tx,
            updated.id,
            &transition.event,
            transition.at,
            updated.state,
        )
        .await?;

        db_tx.commit().await?;
        Ok(updated)
    }

    async fn append_note(
        &self,
        id: TransactionId,
        kind: EventKind,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut db_tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT state FROM transactions WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *db_tx)
            .await?
            .ok_or(BridgeError::NotFound)?;
        let state: TxState = row.get("state");

        Self::append_event_in(&mut *db_tx, id, &kind, at, state).await?;
        db_tx.commit().await?;
        Ok(())
    }

    async fn list_expiring(&self, before: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE state = $1 AND quote_expires_at <= $2",
        )
        .bind(TxState::LightningPending)
        .bind(before)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_transaction).collect()
    }

    async fn list_in_state_older_than(
        &self,
        state: TxState,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE state = $1 AND updated_at <= $2",
        )
        .bind(state)
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_transaction).collect()
    }

    async fn events(&self, id: TransactionId) -> Result<Vec<TransactionEvent>> {
        let rows = sqlx::query(
            "SELECT tx_id, seq, kind, at, state FROM transaction_events \
             WHERE tx_id = $1 ORDER BY seq",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let kind: serde_json::Value = row.get("kind");
                let kind: EventKind = serde_json::from_value(kind)
                    .map_err(|e| BridgeError::Internal(anyhow::Error::new(e)))?;
                Ok(TransactionEvent {
                    tx_id: row.get("tx_id"),
                    seq: row.get("seq"),
                    kind,
                    at: row.get("at"),
                    state: row.get("state"),
                })
            })
            .collect()
    }

    async fn insert_receipt(&self, receipt: Receipt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO receipts (id, tx_id, payload, qr_payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tx_id) DO NOTHING
            "#,
        )
        .bind(receipt.id)
        .bind(receipt.tx_id)
        .bind(&receipt.payload)
        .bind(&receipt.qr_payload)
        .bind(receipt.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_receipt(&self, tx_id: TransactionId) -> Result<Option<Receipt>> {
        let row = sqlx::query("SELECT * FROM receipts WHERE tx_id = $1")
            .bind(tx_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Receipt {
            id: r.get("id"),
            tx_id: r.get("tx_id"),
            payload: r.get("payload"),
            qr_payload: r.get("qr_payload"),
            created_at: r.get("created_at"),
        }))
    }
}
