//! Event store database schema.

/// SQL to create the events and snapshots tables.
///
/// Kept in sync with `migrations/` so `PgEventStore::migrate` can bootstrap a
/// database without the migration runner.
pub const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS covenant_events (
    event_id        UUID PRIMARY KEY,
    aggregate_id    TEXT NOT NULL,
    aggregate_type  TEXT NOT NULL,
    event_type      TEXT NOT NULL,
    version         BIGINT NOT NULL CHECK (version >= 1),
    data            JSONB NOT NULL,
    metadata        JSONB NOT NULL DEFAULT '{}'::jsonb,
    occurred_at     TIMESTAMPTZ NOT NULL,
    correlation_id  UUID,
    causation_id    UUID,
    UNIQUE (aggregate_id, version)
);

CREATE INDEX IF NOT EXISTS idx_covenant_events_type_time
    ON covenant_events (event_type, occurred_at);

CREATE INDEX IF NOT EXISTS idx_covenant_events_correlation_id
    ON covenant_events (correlation_id);

CREATE TABLE IF NOT EXISTS covenant_snapshots (
    aggregate_id    TEXT PRIMARY KEY,
    aggregate_type  TEXT NOT NULL,
    version         BIGINT NOT NULL,
    data            JSONB NOT NULL,
    taken_at        TIMESTAMPTZ NOT NULL
);
";
