use rusqlite::Connection;
use std::path::Path;
use uuid::Uuid;

use crate::auth;

pub fn open_db(data_dir: &Path, admin_password: &str) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("dojang.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // Two daemons may share a data dir (e.g. a reporting sidecar); don't
    // fail fast on a momentarily held write lock.
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS branches(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            address TEXT,
            phone TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL CHECK(role IN ('admin','instructor')),
            branch_id TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_branch ON users(branch_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS belt_ranks(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            color TEXT NOT NULL,
            sort_order INTEGER NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            date_of_birth TEXT,
            guardian_name TEXT,
            phone TEXT,
            belt_rank_id TEXT,
            join_date TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(branch_id) REFERENCES branches(id),
            FOREIGN KEY(belt_rank_id) REFERENCES belt_ranks(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_branch ON students(branch_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS instructors(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            branch_id TEXT NOT NULL,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            phone TEXT,
            belt_rank_id TEXT,
            hire_date TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(branch_id) REFERENCES branches(id),
            FOREIGN KEY(belt_rank_id) REFERENCES belt_ranks(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instructors_branch ON instructors(branch_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('present','absent','late')),
            marked_by TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            UNIQUE(student_id, date),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(branch_id) REFERENCES branches(id),
            FOREIGN KEY(marked_by) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_approvals(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('present','absent','late')),
            requested_by TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending'
                CHECK(state IN ('pending','approved','denied')),
            decided_by TEXT,
            decided_at TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(student_id, date),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(requested_by) REFERENCES users(id),
            FOREIGN KEY(decided_by) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fees(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            month TEXT NOT NULL,
            fee_type TEXT NOT NULL,
            amount REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK(status IN ('pending','paid','overdue')),
            paid_at TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            UNIQUE(student_id, month, fee_type),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fees_student ON fees(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS inventory(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            branch_id TEXT,
            quantity INTEGER NOT NULL CHECK(quantity >= 0),
            price REAL NOT NULL,
            description TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS orders(
            id TEXT PRIMARY KEY,
            order_number TEXT NOT NULL,
            instructor_id TEXT NOT NULL,
            branch_id TEXT,
            total_amount REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK(status IN ('pending','approved','processing',
                                 'shipped','delivered','cancelled')),
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(instructor_id) REFERENCES instructors(id),
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_orders_instructor ON orders(instructor_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS order_items(
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            price REAL NOT NULL,
            FOREIGN KEY(order_id) REFERENCES orders(id),
            FOREIGN KEY(item_id) REFERENCES inventory(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS announcements(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            branch_id TEXT,
            created_by TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            FOREIGN KEY(branch_id) REFERENCES branches(id),
            FOREIGN KEY(created_by) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            announcement_id TEXT,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            type TEXT NOT NULL CHECK(type IN ('announcement','order','order_status')),
            is_read INTEGER NOT NULL DEFAULT 0,
            read_at TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(announcement_id) REFERENCES announcements(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id)",
        [],
    )?;

    // Older data dirs predate the notes column on attendance.
    ensure_attendance_notes(&conn)?;

    seed_belt_ranks(&conn)?;
    seed_admin(&conn, admin_password)?;

    Ok(conn)
}

fn ensure_attendance_notes(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "attendance", "notes")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE attendance ADD COLUMN notes TEXT", [])?;
    Ok(())
}

fn seed_belt_ranks(conn: &Connection) -> anyhow::Result<()> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM belt_ranks", [], |r| r.get(0))?;
    if count > 0 {
        return Ok(());
    }
    let ranks = [
        ("White Belt", "white"),
        ("Yellow Belt", "yellow"),
        ("Green Belt", "green"),
        ("Blue Belt", "blue"),
        ("Red Belt", "red"),
        ("Black Belt 1st Dan", "black"),
        ("Black Belt 2nd Dan", "black"),
        ("Black Belt 3rd Dan", "black"),
    ];
    for (i, (name, color)) in ranks.iter().enumerate() {
        conn.execute(
            "INSERT INTO belt_ranks(id, name, color, sort_order) VALUES(?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                name,
                color,
                i as i64,
            ),
        )?;
    }
    Ok(())
}

fn seed_admin(conn: &Connection, admin_password: &str) -> anyhow::Result<()> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE role = 'admin'",
        [],
        |r| r.get(0),
    )?;
    if count > 0 {
        return Ok(());
    }
    let hash = auth::hash_password(admin_password)?;
    conn.execute(
        "INSERT INTO users(id, username, password_hash, role, branch_id, is_active, created_at)
         VALUES(?, 'admin', ?, 'admin', NULL, 1, ?)",
        (
            Uuid::new_v4().to_string(),
            hash,
            chrono::Utc::now().to_rfc3339(),
        ),
    )?;
    tracing::info!("seeded default admin user");
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
