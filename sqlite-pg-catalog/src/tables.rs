//! Read-only virtual tables backing the `pg_catalog` schema.
//!
//! All tables share a single module. The table name passed to `CREATE
//! VIRTUAL TABLE` selects its shape and row source from [`TABLES`];
//! row sources run on every scan, so `pg_database` always reflects the
//! current contents of the data directory.

use std::marker::PhantomData;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::vtab::{
    read_only_module, sqlite3_vtab, sqlite3_vtab_cursor, Context, CreateVTab, Filters, IndexInfo,
    VTab, VTabConnection, VTabCursor, VTabKind,
};
use rusqlite::{Connection, Error, Result};

const MODULE_NAME: &str = "pg_facade";

type RowsFn = fn(&Path) -> Vec<Vec<Value>>;

struct TableDef {
    name: &'static str,
    ddl: &'static str,
    rows: RowsFn,
}

pub const PG_CATALOG_TABLES: &[&str] = &[
    "pg_database",
    "pg_class",
    "pg_type",
    "pg_namespace",
    "pg_description",
    "pg_settings",
    "pg_range",
];

static TABLES: &[TableDef] = &[
    TableDef {
        name: "pg_database",
        ddl: "CREATE TABLE x(oid INTEGER, datname TEXT, datdba INTEGER, encoding INTEGER, \
              datcollate TEXT, datctype TEXT, datistemplate INTEGER, datallowconn INTEGER, \
              datconnlimit INTEGER, datfrozenxid INTEGER, datminmxid INTEGER, \
              dattablespace INTEGER, datacl TEXT)",
        rows: pg_database_rows,
    },
    TableDef {
        name: "pg_class",
        ddl: "CREATE TABLE x(oid INTEGER, relname TEXT, relnamespace INTEGER, reltype INTEGER, \
              relowner INTEGER, relam INTEGER, relfilenode INTEGER, reltablespace INTEGER, \
              relpages INTEGER, reltuples REAL, relallvisible INTEGER, reltoastrelid INTEGER, \
              relhasindex INTEGER, relisshared INTEGER, relpersistence TEXT, relkind TEXT, \
              relnatts INTEGER, relchecks INTEGER, relhasrules INTEGER, relhastriggers INTEGER, \
              relhassubclass INTEGER, relrowsecurity INTEGER, relforcerowsecurity INTEGER, \
              relispopulated INTEGER, relreplident TEXT, relispartition INTEGER, \
              relrewrite INTEGER, relfrozenxid INTEGER, relminmxid INTEGER, relacl TEXT, \
              reloptions TEXT, relpartbound TEXT)",
        rows: no_rows,
    },
    TableDef {
        name: "pg_type",
        ddl: "CREATE TABLE x(oid INTEGER, typname TEXT, typnamespace INTEGER, typowner INTEGER, \
              typlen INTEGER, typbyval INTEGER, typtype TEXT, typcategory TEXT, \
              typispreferred INTEGER, typisdefined INTEGER, typdelim TEXT, typrelid INTEGER, \
              typelem INTEGER, typarray INTEGER, typinput TEXT, typoutput TEXT, typreceive TEXT, \
              typsend TEXT, typmodin TEXT, typmodout TEXT, typanalyze TEXT, typalign TEXT, \
              typstorage TEXT, typnotnull INTEGER, typbasetype INTEGER, typtypmod INTEGER, \
              typndims INTEGER, typcollation INTEGER, typdefaultbin TEXT, typdefault TEXT, \
              typacl TEXT)",
        rows: no_rows,
    },
    TableDef {
        name: "pg_namespace",
        ddl: "CREATE TABLE x(oid INTEGER, nspname TEXT, nspowner INTEGER, nspacl TEXT)",
        rows: pg_namespace_rows,
    },
    TableDef {
        name: "pg_description",
        ddl: "CREATE TABLE x(objoid INTEGER, classoid INTEGER, objsubid INTEGER, \
              description TEXT)",
        rows: no_rows,
    },
    TableDef {
        name: "pg_settings",
        ddl: "CREATE TABLE x(name TEXT, setting TEXT, unit TEXT, category TEXT, \
              short_desc TEXT, extra_desc TEXT, context TEXT, vartype TEXT, source TEXT, \
              min_val TEXT, max_val TEXT, enumvals TEXT, boot_val TEXT, reset_val TEXT, \
              sourcefile TEXT, sourceline INTEGER, pending_restart INTEGER)",
        rows: pg_settings_rows,
    },
    TableDef {
        name: "pg_range",
        ddl: "CREATE TABLE x(rngtypid INTEGER, rngsubtype INTEGER, rngmultitypid INTEGER, \
              rngcollation INTEGER, rngsubopc INTEGER, rngcanonical TEXT, rngsubdiff TEXT)",
        rows: no_rows,
    },
];

fn no_rows(_data_dir: &Path) -> Vec<Vec<Value>> {
    Vec::new()
}

fn pg_database_rows(data_dir: &Path) -> Vec<Vec<Value>> {
    crate::list_databases(data_dir)
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            vec![
                Value::Integer(16384 + i as i64),
                Value::Text(name),
                Value::Integer(10),
                Value::Integer(6),
                Value::Text("en_US.UTF-8".to_string()),
                Value::Text("en_US.UTF-8".to_string()),
                Value::Integer(0),
                Value::Integer(1),
                Value::Integer(-1),
                Value::Integer(726),
                Value::Integer(1),
                Value::Integer(1663),
                Value::Null,
            ]
        })
        .collect()
}

fn pg_namespace_rows(_data_dir: &Path) -> Vec<Vec<Value>> {
    vec![
        vec![
            Value::Integer(11),
            Value::Text("pg_catalog".to_string()),
            Value::Integer(10),
            Value::Null,
        ],
        vec![
            Value::Integer(2200),
            Value::Text("public".to_string()),
            Value::Integer(10),
            Value::Null,
        ],
    ]
}

fn pg_settings_rows(_data_dir: &Path) -> Vec<Vec<Value>> {
    let setting = |name: &str, value: &str, vartype: &str| {
        vec![
            Value::Text(name.to_string()),
            Value::Text(value.to_string()),
            Value::Null,
            Value::Text("Preset Options".to_string()),
            Value::Null,
            Value::Null,
            Value::Text("internal".to_string()),
            Value::Text(vartype.to_string()),
            Value::Text("default".to_string()),
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Text(value.to_string()),
            Value::Text(value.to_string()),
            Value::Null,
            Value::Null,
            Value::Integer(0),
        ]
    };
    vec![
        setting("server_version", "14.9", "string"),
        setting("standard_conforming_strings", "on", "bool"),
        setting("max_connections", "100", "integer"),
    ]
}

fn def_by_name(name: &str) -> Option<&'static TableDef> {
    TABLES.iter().find(|def| def.name == name)
}

pub(crate) fn register_tables(conn: &Connection, data_dir: &Path) -> Result<()> {
    conn.create_module(
        MODULE_NAME,
        read_only_module::<FacadeTab>(),
        Some(data_dir.to_path_buf()),
    )?;
    for def in TABLES {
        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS pg_catalog.{} USING {}",
            def.name, MODULE_NAME
        ))?;
    }
    Ok(())
}

#[repr(C)]
pub(crate) struct FacadeTab {
    base: sqlite3_vtab,
    data_dir: PathBuf,
    def: &'static TableDef,
}

unsafe impl<'vtab> VTab<'vtab> for FacadeTab {
    type Aux = PathBuf;
    type Cursor = FacadeTabCursor<'vtab>;

    fn connect(
        _db: &mut VTabConnection,
        aux: Option<&Self::Aux>,
        args: &[&[u8]],
    ) -> Result<(String, Self)> {
        let table_name = args
            .get(2)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .ok_or_else(|| Error::ModuleError("missing table name".to_string()))?;
        let def = def_by_name(table_name)
            .ok_or_else(|| Error::ModuleError(format!("unknown catalog table {table_name}")))?;
        let data_dir = aux.cloned().unwrap_or_default();
        let vtab = FacadeTab {
            base: sqlite3_vtab::default(),
            data_dir,
            def,
        };
        Ok((def.ddl.to_string(), vtab))
    }

    fn best_index(&self, info: &mut IndexInfo) -> Result<()> {
        info.set_estimated_cost(1_000_000.);
        Ok(())
    }

    fn open(&'vtab mut self) -> Result<Self::Cursor> {
        Ok(FacadeTabCursor {
            base: sqlite3_vtab_cursor::default(),
            data_dir: self.data_dir.clone(),
            rows_fn: self.def.rows,
            rows: Vec::new(),
            row_id: 0,
            phantom: PhantomData,
        })
    }
}

impl CreateVTab<'_> for FacadeTab {
    const KIND: VTabKind = VTabKind::Default;
}

#[repr(C)]
pub(crate) struct FacadeTabCursor<'vtab> {
    base: sqlite3_vtab_cursor,
    data_dir: PathBuf,
    rows_fn: RowsFn,
    rows: Vec<Vec<Value>>,
    row_id: usize,
    phantom: PhantomData<&'vtab FacadeTab>,
}

unsafe impl VTabCursor for FacadeTabCursor<'_> {
    fn filter(&mut self, _idx_num: c_int, _idx_str: Option<&str>, _args: &Filters<'_>) -> Result<()> {
        self.rows = (self.rows_fn)(&self.data_dir);
        self.row_id = 0;
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        self.row_id += 1;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.row_id >= self.rows.len()
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> Result<()> {
        let value = self
            .rows
            .get(self.row_id)
            .and_then(|row| row.get(i as usize))
            .unwrap_or(&Value::Null);
        ctx.set_result(value)
    }

    fn rowid(&self) -> Result<i64> {
        Ok(self.row_id as i64)
    }
}
