// PRE-LAUNCH ONLY — single squashed schema, no migration chain.
// All tables are created in one flat block; restore incremental migrations
// if shipped user data ever needs preserving.
pub fn run_migrations(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS persons (
            person_id          INTEGER PRIMARY KEY,
            name               TEXT NOT NULL,
            output_folder_rel  TEXT NOT NULL UNIQUE,
            created_at         TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS person_embeddings (
            embedding_id  INTEGER PRIMARY KEY,
            person_id     INTEGER NOT NULL REFERENCES persons(person_id) ON DELETE CASCADE,
            embedding     BLOB NOT NULL,
            source_type   TEXT NOT NULL,
            created_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS person_centroids (
            person_id        INTEGER PRIMARY KEY REFERENCES persons(person_id) ON DELETE CASCADE,
            centroid         BLOB NOT NULL,
            embedding_count  INTEGER NOT NULL,
            updated_at       TEXT NOT NULL
        );

        -- Singleton row (id = 1): what the operator configured.
        CREATE TABLE IF NOT EXISTS job_config (
            id                    INTEGER PRIMARY KEY CHECK (id = 1),
            source_root           TEXT,
            output_root           TEXT,
            selected_person_ids   TEXT,
            selected_image_paths  TEXT,
            group_mode            INTEGER NOT NULL DEFAULT 0,
            group_folder_name     TEXT,
            job_status            TEXT NOT NULL DEFAULT 'configured',
            updated_at            TEXT
        );

        CREATE TABLE IF NOT EXISTS jobs (
            job_id            INTEGER PRIMARY KEY,
            source_root       TEXT NOT NULL,
            output_root       TEXT NOT NULL,
            status            TEXT NOT NULL DEFAULT 'active',
            total_images      INTEGER NOT NULL DEFAULT 0,
            processed_images  INTEGER NOT NULL DEFAULT 0,
            created_at        TEXT NOT NULL,
            updated_at        TEXT
        );

        CREATE TABLE IF NOT EXISTS images (
            image_id      INTEGER PRIMARY KEY,
            job_id        INTEGER NOT NULL REFERENCES jobs(job_id),
            source_path   TEXT NOT NULL,
            filename      TEXT NOT NULL,
            extension     TEXT NOT NULL,
            sha256        TEXT,
            ordering_idx  INTEGER NOT NULL,
            UNIQUE(job_id, ordering_idx)
        );

        CREATE TABLE IF NOT EXISTS batches (
            batch_id      INTEGER PRIMARY KEY,
            job_id        INTEGER NOT NULL REFERENCES jobs(job_id),
            start_idx     INTEGER NOT NULL,
            end_idx       INTEGER NOT NULL,
            state         TEXT NOT NULL DEFAULT 'PENDING',
            created_at    TEXT NOT NULL,
            started_at    TEXT,
            committed_at  TEXT
        );

        CREATE TABLE IF NOT EXISTS image_results (
            image_id            INTEGER PRIMARY KEY REFERENCES images(image_id),
            batch_id            INTEGER NOT NULL REFERENCES batches(batch_id),
            face_count          INTEGER NOT NULL,
            matched_count       INTEGER NOT NULL,
            unknown_count       INTEGER NOT NULL,
            matched_person_ids  TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        -- Audit trail of fan-out writes. Recovery never reads it: resume
        -- relies on deterministic names + destination existence alone.
        CREATE TABLE IF NOT EXISTS commit_log (
            commit_id        INTEGER PRIMARY KEY,
            batch_id         INTEGER NOT NULL,
            image_id         INTEGER NOT NULL,
            person_id        INTEGER,
            output_filename  TEXT NOT NULL,
            output_path      TEXT NOT NULL,
            status           TEXT NOT NULL,
            created_at       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_embeddings_person  ON person_embeddings(person_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_images_ordering    ON images(job_id, ordering_idx);
        CREATE INDEX IF NOT EXISTS idx_batches_state      ON batches(state, batch_id);
        CREATE INDEX IF NOT EXISTS idx_results_batch      ON image_results(batch_id);

        INSERT INTO schema_version SELECT 0
            WHERE NOT EXISTS (SELECT 1 FROM schema_version);
        UPDATE schema_version SET version = 1 WHERE version < 1;
        ",
    )?;

    Ok(())
}

pub fn schema_version(conn: &rusqlite::Connection) -> anyhow::Result<u32> {
    let version: u32 = conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
        row.get(0)
    })?;
    Ok(version)
}
