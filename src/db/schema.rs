use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS samples (
            seq         INTEGER PRIMARY KEY,
            size        REAL,
            observed_at TEXT NOT NULL -- RFC 3339, nanosecond precision
        );

        -- Present once a snapshot has been written; a missing row means no snapshot yet.
        CREATE TABLE IF NOT EXISTS snapshot_meta (
            id           INTEGER PRIMARY KEY CHECK (id = 1),
            saved_at     TEXT NOT NULL,
            sample_count INTEGER NOT NULL
        );
        ",
    )?;
    Ok(())
}
