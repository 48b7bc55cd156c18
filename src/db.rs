use rusqlite::Connection;
use std::path::Path;

/// Delta flag domain shared by the whole delta-tagged hierarchy.
pub const DELTA_CURRENT: &str = "";
pub const DELTA_NEW: &str = "new";
pub const DELTA_REMOVED: &str = "removed";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("timetable.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS organizations(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            scheduling_enabled INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS blocks(
            id TEXT PRIMARY KEY,
            date TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            weekday INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rooms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS persons(
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL
        )",
        [],
    )?;

    // Curriculum tree. parent_id is NULL at the root.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS study_groups(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            parent_id TEXT,
            FOREIGN KEY(parent_id) REFERENCES study_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_study_groups_parent ON study_groups(parent_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            code TEXT NOT NULL,
            title TEXT NOT NULL,
            FOREIGN KEY(group_id) REFERENCES study_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_group ON subjects(group_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_code ON subjects(code)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            title TEXT NOT NULL,
            subject_id TEXT,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    ensure_events_subject_id(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_code ON events(code)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS units(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            code TEXT NOT NULL,
            delta TEXT NOT NULL DEFAULT 'new',
            modified TEXT,
            FOREIGN KEY(org_id) REFERENCES organizations(id),
            FOREIGN KEY(term_id) REFERENCES terms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_units_scope ON units(org_id, term_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS instances(
            id TEXT PRIMARY KEY,
            unit_id TEXT NOT NULL,
            block_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            delta TEXT NOT NULL DEFAULT 'new',
            modified TEXT,
            FOREIGN KEY(unit_id) REFERENCES units(id),
            FOREIGN KEY(block_id) REFERENCES blocks(id),
            FOREIGN KEY(event_id) REFERENCES events(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instances_unit ON instances(unit_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instances_unit_block ON instances(unit_id, block_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instances_event ON instances(event_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS instance_persons(
            id TEXT PRIMARY KEY,
            instance_id TEXT NOT NULL,
            person_id TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'lecturer',
            delta TEXT NOT NULL DEFAULT 'new',
            modified TEXT,
            UNIQUE(instance_id, person_id),
            FOREIGN KEY(instance_id) REFERENCES instances(id),
            FOREIGN KEY(person_id) REFERENCES persons(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instance_persons_instance ON instance_persons(instance_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instance_persons_person ON instance_persons(person_id)",
        [],
    )?;

    // assoc_id is the owning instance_persons.id.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS instance_groups(
            assoc_id TEXT NOT NULL,
            group_id TEXT NOT NULL,
            delta TEXT NOT NULL DEFAULT 'new',
            modified TEXT,
            PRIMARY KEY(assoc_id, group_id),
            FOREIGN KEY(assoc_id) REFERENCES instance_persons(id),
            FOREIGN KEY(group_id) REFERENCES study_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instance_groups_group ON instance_groups(group_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS instance_rooms(
            assoc_id TEXT NOT NULL,
            room_id TEXT NOT NULL,
            delta TEXT NOT NULL DEFAULT 'new',
            modified TEXT,
            PRIMARY KEY(assoc_id, room_id),
            FOREIGN KEY(assoc_id) REFERENCES instance_persons(id),
            FOREIGN KEY(room_id) REFERENCES rooms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instance_rooms_room ON instance_rooms(room_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bookings(
            id TEXT PRIMARY KEY,
            block_id TEXT NOT NULL,
            unit_id TEXT NOT NULL,
            opened_at TEXT,
            UNIQUE(block_id, unit_id),
            FOREIGN KEY(block_id) REFERENCES blocks(id),
            FOREIGN KEY(unit_id) REFERENCES units(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bookings_unit ON bookings(unit_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS booking_checkins(
            id TEXT PRIMARY KEY,
            booking_id TEXT NOT NULL,
            person_id TEXT NOT NULL,
            checked_in_at TEXT,
            FOREIGN KEY(booking_id) REFERENCES bookings(id),
            FOREIGN KEY(person_id) REFERENCES persons(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_booking_checkins_booking ON booking_checkins(booking_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS instance_participants(
            id TEXT PRIMARY KEY,
            instance_id TEXT NOT NULL,
            person_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'registered',
            UNIQUE(instance_id, person_id),
            FOREIGN KEY(instance_id) REFERENCES instances(id),
            FOREIGN KEY(person_id) REFERENCES persons(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instance_participants_instance ON instance_participants(instance_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedule_snapshots(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            creation_date TEXT NOT NULL,
            creation_time TEXT NOT NULL,
            payload TEXT NOT NULL,
            FOREIGN KEY(org_id) REFERENCES organizations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedule_snapshots_scope
         ON schedule_snapshots(org_id, term_id, creation_date, creation_time)",
        [],
    )?;

    Ok(())
}

fn ensure_events_subject_id(conn: &Connection) -> anyhow::Result<()> {
    // Workspaces created before subject linking shipped lack the column.
    if table_has_column(conn, "events", "subject_id")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE events ADD COLUMN subject_id TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
