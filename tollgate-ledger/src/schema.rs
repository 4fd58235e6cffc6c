use sqlx::SqlitePool;

use crate::LedgerError;

// Money columns hold nano-dollars (scale 9). Asset columns hold the token's
// smallest unit. Multipliers and shares are decimal strings.
const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id            TEXT PRIMARY KEY,
    email         TEXT,
    total_paid    INTEGER NOT NULL DEFAULT 0 CHECK (total_paid >= 0),
    total_spent   INTEGER NOT NULL DEFAULT 0 CHECK (total_spent >= 0),
    archived      INTEGER NOT NULL DEFAULT 0,
    created_at    INTEGER NOT NULL,
    CHECK (total_spent <= total_paid)
);

CREATE TABLE IF NOT EXISTS apps (
    id                TEXT PRIMARY KEY,
    name              TEXT NOT NULL,
    markup            TEXT NOT NULL,
    referrer_user_id  TEXT REFERENCES users(id),
    referral_share    TEXT NOT NULL DEFAULT '0',
    archived          INTEGER NOT NULL DEFAULT 0,
    created_at        INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS app_members (
    app_id      TEXT NOT NULL REFERENCES apps(id),
    user_id     TEXT NOT NULL REFERENCES users(id),
    role        TEXT NOT NULL CHECK (role IN ('owner', 'customer')),
    created_at  INTEGER NOT NULL,
    PRIMARY KEY (app_id, user_id)
);

CREATE TABLE IF NOT EXISTS spend_pools (
    app_id          TEXT PRIMARY KEY REFERENCES apps(id),
    total_funded    INTEGER NOT NULL DEFAULT 0 CHECK (total_funded >= 0),
    total_spent     INTEGER NOT NULL DEFAULT 0 CHECK (total_spent >= 0),
    per_user_limit  INTEGER CHECK (per_user_limit IS NULL OR per_user_limit >= 0),
    CHECK (total_spent <= total_funded)
);

CREATE TABLE IF NOT EXISTS spend_pool_usage (
    app_id   TEXT NOT NULL REFERENCES spend_pools(app_id),
    user_id  TEXT NOT NULL REFERENCES users(id),
    spent    INTEGER NOT NULL DEFAULT 0 CHECK (spent >= 0),
    PRIMARY KEY (app_id, user_id)
);

CREATE TABLE IF NOT EXISTS api_keys (
    id          TEXT PRIMARY KEY,
    key_hash    TEXT NOT NULL UNIQUE,
    user_id     TEXT NOT NULL REFERENCES users(id),
    app_id      TEXT NOT NULL REFERENCES apps(id),
    scope       TEXT NOT NULL DEFAULT '*',
    name        TEXT,
    archived    INTEGER NOT NULL DEFAULT 0,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS revoked_tokens (
    jti         TEXT PRIMARY KEY,
    expires_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS reservations (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL REFERENCES users(id),
    app_id      TEXT NOT NULL REFERENCES apps(id),
    source      TEXT NOT NULL CHECK (source IN ('spend_pool', 'user_balance')),
    amount      INTEGER NOT NULL CHECK (amount >= 0),
    state       TEXT NOT NULL DEFAULT 'open' CHECK (state IN ('open', 'committed', 'released')),
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS reservations_open ON reservations (state, created_at);

CREATE TABLE IF NOT EXISTS transactions (
    id                      TEXT PRIMARY KEY,
    user_id                 TEXT NOT NULL REFERENCES users(id),
    app_id                  TEXT NOT NULL REFERENCES apps(id),
    api_key_id              TEXT,
    funding_source          TEXT NOT NULL CHECK (funding_source IN ('spend_pool', 'user_balance', 'x402')),
    reservation_id          TEXT UNIQUE,
    payment_id              TEXT UNIQUE,
    provider                TEXT NOT NULL,
    model                   TEXT NOT NULL,
    input_tokens            INTEGER NOT NULL,
    output_tokens           INTEGER NOT NULL,
    cached_input_tokens     INTEGER NOT NULL,
    raw_cost                INTEGER NOT NULL,
    app_markup_profit       INTEGER NOT NULL,
    platform_markup_profit  INTEGER NOT NULL,
    total_cost              INTEGER NOT NULL,
    archived                INTEGER NOT NULL DEFAULT 0,
    created_at              INTEGER NOT NULL,
    CHECK (raw_cost + app_markup_profit + platform_markup_profit = total_cost)
);
CREATE INDEX IF NOT EXISTS transactions_user ON transactions (user_id, created_at);
CREATE INDEX IF NOT EXISTS transactions_app ON transactions (app_id, created_at);

CREATE TABLE IF NOT EXISTS reconciliation_items (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    transaction_id  TEXT REFERENCES transactions(id),
    reference       TEXT,
    kind            TEXT NOT NULL,
    detail          TEXT NOT NULL,
    resolved        INTEGER NOT NULL DEFAULT 0,
    created_at      INTEGER NOT NULL,
    CHECK (transaction_id IS NOT NULL OR reference IS NOT NULL)
);
CREATE INDEX IF NOT EXISTS reconciliation_open ON reconciliation_items (resolved, transaction_id, kind);

CREATE TABLE IF NOT EXISTS payments (
    id           TEXT PRIMARY KEY,
    external_id  TEXT NOT NULL UNIQUE,
    user_id      TEXT REFERENCES users(id),
    app_id       TEXT REFERENCES apps(id),
    kind         TEXT NOT NULL CHECK (kind IN ('card', 'crypto')),
    amount       INTEGER NOT NULL CHECK (amount >= 0),
    status       TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'failed')),
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS webhook_events (
    event_id     TEXT PRIMARY KEY,
    event_type   TEXT NOT NULL,
    received_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS payouts (
    id              TEXT PRIMARY KEY,
    transaction_id  TEXT NOT NULL REFERENCES transactions(id),
    app_id          TEXT NOT NULL REFERENCES apps(id),
    recipient_kind  TEXT NOT NULL CHECK (recipient_kind IN ('app', 'referrer')),
    recipient_id    TEXT NOT NULL,
    amount          INTEGER NOT NULL CHECK (amount > 0),
    status          TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'completed')),
    batch_id        TEXT,
    created_at      INTEGER NOT NULL,
    paid_at         INTEGER
);
CREATE INDEX IF NOT EXISTS payouts_pending ON payouts (status, recipient_kind, recipient_id);

CREATE TABLE IF NOT EXISTS x402_challenges (
    nonce         TEXT PRIMARY KEY,
    user_id       TEXT NOT NULL REFERENCES users(id),
    app_id        TEXT NOT NULL REFERENCES apps(id),
    amount_units  INTEGER NOT NULL CHECK (amount_units >= 0),
    requirements  TEXT NOT NULL,
    payment_id    TEXT,
    state         TEXT NOT NULL DEFAULT 'issued' CHECK (state IN ('issued', 'claimed', 'completed', 'failed')),
    failure       TEXT,
    expires_at    INTEGER NOT NULL,
    created_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS x402_settlements (
    transaction_id  TEXT PRIMARY KEY REFERENCES transactions(id),
    payment_id      TEXT NOT NULL REFERENCES payments(id),
    payer           TEXT NOT NULL,
    paid_units      INTEGER NOT NULL,
    owed_units      INTEGER NOT NULL,
    refund_units    INTEGER NOT NULL CHECK (refund_units >= 0),
    payload         TEXT NOT NULL,
    requirements    TEXT NOT NULL,
    settle_state    TEXT NOT NULL DEFAULT 'pending' CHECK (settle_state IN ('pending', 'in_flight', 'settled', 'failed')),
    settle_tx       TEXT,
    settle_error    TEXT,
    refund_state    TEXT NOT NULL CHECK (refund_state IN ('not_required', 'pending', 'in_flight', 'sent', 'failed')),
    refund_tx       TEXT,
    refund_error    TEXT,
    attempts        INTEGER NOT NULL DEFAULT 0,
    updated_at      INTEGER NOT NULL
);
";

pub(crate) async fn init(pool: &SqlitePool) -> Result<(), LedgerError> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}
