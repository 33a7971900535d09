/// Star schema applied by [`crate::PgWarehouse::migrate`]. Safe to re-run.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dim_customer (
    customer_key  SERIAL PRIMARY KEY,
    customer_id   TEXT NOT NULL UNIQUE,
    name          TEXT NOT NULL,
    email         TEXT
);

CREATE TABLE IF NOT EXISTS dim_product (
    product_key   SERIAL PRIMARY KEY,
    product_id    TEXT NOT NULL UNIQUE,
    name          TEXT NOT NULL,
    category      TEXT,
    subcategory   TEXT
);

CREATE TABLE IF NOT EXISTS dim_source (
    source_key    SERIAL PRIMARY KEY,
    source_id     TEXT NOT NULL UNIQUE,
    name          TEXT NOT NULL,
    kind          TEXT NOT NULL,
    loaded_at     TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS dim_sentiment (
    sentiment_key SERIAL PRIMARY KEY,
    label         TEXT NOT NULL UNIQUE,
    description   TEXT,
    weight        INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS dim_date (
    date_key      INTEGER PRIMARY KEY,
    full_date     DATE NOT NULL UNIQUE,
    year          INTEGER NOT NULL,
    quarter       INTEGER NOT NULL,
    month         INTEGER NOT NULL,
    month_name    TEXT NOT NULL,
    iso_week      INTEGER NOT NULL,
    day           INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS fact_opinion (
    opinion_key   BIGSERIAL PRIMARY KEY,
    customer_key  INTEGER NOT NULL REFERENCES dim_customer (customer_key),
    product_key   INTEGER NOT NULL REFERENCES dim_product (product_key),
    source_key    INTEGER NOT NULL REFERENCES dim_source (source_key),
    sentiment_key INTEGER NOT NULL REFERENCES dim_sentiment (sentiment_key),
    date_key      INTEGER NOT NULL REFERENCES dim_date (date_key),
    rating        NUMERIC(4, 2) NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fact_opinion_date ON fact_opinion (date_key);
CREATE INDEX IF NOT EXISTS idx_fact_opinion_product ON fact_opinion (product_key);
"#;
