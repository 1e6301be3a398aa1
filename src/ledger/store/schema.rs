/// Idempotent schema, one statement per entry so it can run inside a single
/// transaction with parameterless `execute` calls.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS ledger_staging (
        block       INTEGER     NOT NULL,
        from_addr   TEXT        NULL,
        to_addr     TEXT        NULL,
        block_time  TIMESTAMPTZ NOT NULL,
        block_hash  BYTEA       NOT NULL,
        tx_hash     BYTEA       NOT NULL,
        value       BIGINT      NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS ledger_staging_key
        ON ledger_staging (block, tx_hash, (COALESCE(to_addr, '')))
    "#,
    "CREATE INDEX IF NOT EXISTS ledger_staging_block ON ledger_staging (block)",
    "CREATE INDEX IF NOT EXISTS ledger_staging_from ON ledger_staging (from_addr)",
    "CREATE INDEX IF NOT EXISTS ledger_staging_to ON ledger_staging (to_addr)",
    r#"
    CREATE TABLE IF NOT EXISTS ledger_confirmed (
        block       INTEGER     NOT NULL,
        from_addr   TEXT        NULL,
        to_addr     TEXT        NULL,
        tx_time     TIMESTAMPTZ NOT NULL,
        tx_hash     BYTEA       NOT NULL,
        value       BIGINT      NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS ledger_confirmed_key
        ON ledger_confirmed (block, tx_hash, (COALESCE(to_addr, '')))
    "#,
    "CREATE INDEX IF NOT EXISTS ledger_confirmed_from_to ON ledger_confirmed (from_addr, to_addr)",
    "CREATE INDEX IF NOT EXISTS ledger_confirmed_to ON ledger_confirmed (to_addr)",
    r#"
    CREATE TABLE IF NOT EXISTS ledger_tracked_address (
        address     TEXT        PRIMARY KEY,
        checked     TIMESTAMPTZ NOT NULL
    )
    "#,
];
