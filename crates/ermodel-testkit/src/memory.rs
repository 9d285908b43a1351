//! In-memory database with snapshot isolation.
//!
//! Every connection reads from a snapshot taken at its first statement and
//! keeps its writes private until commit. Writing a row that another
//! connection has written since the snapshot, or is writing now, fails with
//! SQLSTATE 40001 the way a serializable database would.
//!
//! Schema statements and sequences take effect immediately and are not
//! rolled back.

use crate::sql::{self, ColumnDef, Condition, Expr, Projection, Select, Statement};
use ermodel_core::{
    ColumnInfo, Connection, Database, Dialect, Error, QueryError, QueryErrorKind, Result, Row,
    StandardDialect, Value, standard_literal,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

// ============================================================================
// Storage
// ============================================================================

/// One committed state of a row. `None` marks a deletion.
#[derive(Debug, Clone)]
struct Version {
    seq: u64,
    values: Option<Vec<Value>>,
}

#[derive(Debug)]
struct Table {
    columns: Vec<ColumnDef>,
    primary_key: Vec<usize>,
    rows: BTreeMap<String, Vec<Version>>,
}

impl Table {

    fn index_of(&self, sql: &str, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(column))
            .ok_or_else(|| undefined_column(sql, column))
    }

    fn key_of(&self, values: &[Value]) -> Option<String> {
        let parts: Vec<&Value> = self.primary_key.iter().map(|&i| &values[i]).collect();
        if parts.iter().any(|v| v.is_null()) {
            return None;
        }
        Some(row_key(parts))
    }

    fn latest(&self, key: &str) -> Option<&Version> {
        self.rows.get(key).and_then(|versions| versions.last())
    }

    fn committed_rows(&self, snapshot: u64) -> BTreeMap<String, Vec<Value>> {
        self.rows
            .iter()
            .filter_map(|(key, versions)| {
                versions
                    .iter()
                    .rev()
                    .find(|v| v.seq <= snapshot)
                    .and_then(|v| v.values.clone())
                    .map(|values| (key.clone(), values))
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct Store {
    schemas: BTreeSet<String>,
    tables: BTreeMap<String, Table>,
    views: BTreeMap<String, String>,
    sequences: BTreeMap<String, i64>,
    commit_seq: u64,
    /// Rows written by an open SQL transaction, and its connection.
    locks: HashMap<(String, String), u64>,
}

impl Store {
    fn table(&self, sql: &str, name: &str) -> Result<&Table> {
        self.tables.get(name).ok_or_else(|| undefined_table(sql, name))
    }

    fn exists(&self, name: &str) -> bool {
        self.tables.contains_key(name)
            || self.views.contains_key(name)
            || self.sequences.contains_key(name)
    }

    fn release(&mut self, connection: u64) {
        self.locks.retain(|_, owner| *owner != connection);
    }
}

fn row_key<'a>(values: impl IntoIterator<Item = &'a Value>) -> String {
    values
        .into_iter()
        .map(standard_literal)
        .collect::<Vec<_>>()
        .join(",")
}

/// Result-set metadata for `columns`, reporting their declared types.
fn column_info(columns: &[ColumnDef]) -> Arc<ColumnInfo> {
    Arc::new(ColumnInfo::with_types(
        columns.iter().map(|c| c.name.clone()).collect(),
        columns.iter().map(|c| c.sql_type.clone()).collect(),
    ))
}

fn lock_store(store: &Mutex<Store>) -> MutexGuard<'_, Store> {
    store.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Errors
// ============================================================================

fn query_error(kind: QueryErrorKind, sqlstate: &str, sql: &str, message: String) -> Error {
    Error::Query(
        QueryError::new(kind, message)
            .with_sqlstate(sqlstate)
            .with_sql(sql),
    )
}

fn undefined_table(sql: &str, name: &str) -> Error {
    query_error(
        QueryErrorKind::NotFound,
        "42P01",
        sql,
        format!("relation \"{}\" does not exist", name),
    )
}

fn undefined_column(sql: &str, name: &str) -> Error {
    query_error(
        QueryErrorKind::NotFound,
        "42703",
        sql,
        format!("column \"{}\" does not exist", name),
    )
}

fn duplicate(sql: &str, sqlstate: &str, name: &str) -> Error {
    query_error(
        QueryErrorKind::Database,
        sqlstate,
        sql,
        format!("\"{}\" already exists", name),
    )
}

fn missing_schema(sql: &str, name: &str) -> Error {
    query_error(
        QueryErrorKind::NotFound,
        "3F000",
        sql,
        format!("schema \"{}\" does not exist", name),
    )
}

// ============================================================================
// Database
// ============================================================================

/// A database living in process memory.
///
/// Clones of the `Arc` share one store; every [`connect`](Database::connect)
/// opens an independent connection on it.
pub struct MemoryDatabase {
    store: Arc<Mutex<Store>>,
    dialect: Box<dyn Dialect>,
    next_connection: AtomicU64,
    conflicts: Arc<AtomicU64>,
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("dialect", &self.dialect.name())
            .field("conflicts", &self.conflicts())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    /// An empty database speaking standard SQL.
    pub fn new() -> Self {
        Self::with_dialect(StandardDialect)
    }

    pub fn with_dialect(dialect: impl Dialect + 'static) -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            dialect: Box::new(dialect),
            next_connection: AtomicU64::new(1),
            conflicts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of serialization failures reported so far.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    pub fn has_table(&self, name: &str) -> bool {
        lock_store(&self.store).tables.contains_key(name)
    }

    /// Current value of a sequence, if it exists.
    pub fn sequence_value(&self, name: &str) -> Option<i64> {
        lock_store(&self.store).sequences.get(name).copied()
    }

    /// Committed rows of a table, ordered by their rendered key.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        let store = lock_store(&self.store);
        let sql = format!("SELECT * FROM {}", table);
        let table = store.table(&sql, table)?;
        let columns = column_info(&table.columns);
        Ok(table
            .committed_rows(store.commit_seq)
            .into_values()
            .map(|values| Row::with_columns(Arc::clone(&columns), values))
            .collect())
    }
}

impl Database for MemoryDatabase {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(connection = id, "Opening memory connection");
        Ok(Box::new(MemoryConnection {
            id,
            store: Arc::clone(&self.store),
            conflicts: Arc::clone(&self.conflicts),
            snapshot: None,
            writes: BTreeMap::new(),
        }))
    }

    fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }
}

// ============================================================================
// Connection
// ============================================================================

enum Outcome {
    Rows(Vec<Row>),
    Affected(u64),
}

/// A connection to a [`MemoryDatabase`].
pub struct MemoryConnection {
    id: u64,
    store: Arc<Mutex<Store>>,
    conflicts: Arc<AtomicU64>,
    snapshot: Option<u64>,
    writes: BTreeMap<(String, String), Option<Vec<Value>>>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("snapshot", &self.snapshot)
            .field("writes", &self.writes.len())
            .finish_non_exhaustive()
    }
}

impl MemoryConnection {
    fn run(&mut self, sql: &str, params: &[Value]) -> Result<Outcome> {
        let statement = sql::parse(sql, params)?;
        let store = Arc::clone(&self.store);
        let mut store = lock_store(&store);
        match statement {
            Statement::Ignored | Statement::CreateIndex => Ok(Outcome::Affected(0)),
            Statement::CreateSchema(name) => {
                if !store.schemas.insert(name.clone()) {
                    return Err(duplicate(sql, "42P06", &name));
                }
                Ok(Outcome::Affected(0))
            }
            Statement::CreateTable {
                name,
                columns,
                primary_key,
            } => {
                Self::check_new(&store, sql, &name)?;
                let mut table = Table {
                    columns,
                    primary_key: Vec::new(),
                    rows: BTreeMap::new(),
                };
                table.primary_key = primary_key
                    .iter()
                    .map(|c| table.index_of(sql, c))
                    .collect::<Result<_>>()?;
                store.tables.insert(name, table);
                Ok(Outcome::Affected(0))
            }
            Statement::CreateSequence(name) => {
                Self::check_new(&store, sql, &name)?;
                store.sequences.insert(name, 0);
                Ok(Outcome::Affected(0))
            }
            Statement::CreateView { name, query } => {
                Self::check_new(&store, sql, &name)?;
                store.views.insert(name, query);
                Ok(Outcome::Affected(0))
            }
            Statement::DropSchema(name) => {
                if !store.schemas.remove(&name) {
                    return Err(missing_schema(sql, &name));
                }
                let prefix = format!("{}.", name);
                store.tables.retain(|t, _| !t.starts_with(&prefix));
                store.views.retain(|v, _| !v.starts_with(&prefix));
                store.sequences.retain(|s, _| !s.starts_with(&prefix));
                store.locks.retain(|(t, _), _| !t.starts_with(&prefix));
                Ok(Outcome::Affected(0))
            }
            Statement::NextVal(name) => {
                self.begin(&store);
                let value = store
                    .sequences
                    .get_mut(&name)
                    .ok_or_else(|| undefined_table(sql, &name))?;
                *value += 1;
                let row = Row::new(vec!["nextval".to_string()], vec![Value::BigInt(*value)]);
                Ok(Outcome::Rows(vec![row]))
            }
            Statement::Insert {
                table,
                columns,
                values,
            } => {
                self.begin(&store);
                self.insert(&mut store, sql, &table, &columns, values)
                    .map(Outcome::Affected)
            }
            Statement::Update {
                table,
                assignments,
                filter,
            } => {
                self.begin(&store);
                self.update(&mut store, sql, &table, &assignments, &filter)
                    .map(Outcome::Affected)
            }
            Statement::Delete { table, filter } => {
                self.begin(&store);
                self.delete(&mut store, sql, &table, &filter)
                    .map(Outcome::Affected)
            }
            Statement::Select(select) => {
                self.begin(&store);
                self.select(&mut store, sql, &select).map(Outcome::Rows)
            }
        }
    }

    fn check_new(store: &Store, sql: &str, name: &str) -> Result<()> {
        if let Some((schema, _)) = name.split_once('.') {
            if !store.schemas.contains(schema) {
                return Err(missing_schema(sql, schema));
            }
        }
        if store.exists(name) {
            return Err(duplicate(sql, "42P07", name));
        }
        Ok(())
    }

    fn begin(&mut self, store: &Store) {
        if self.snapshot.is_none() {
            self.snapshot = Some(store.commit_seq);
            tracing::trace!(connection = self.id, snapshot = store.commit_seq, "Snapshot taken");
        }
    }

    fn snapshot(&self, store: &Store) -> u64 {
        self.snapshot.unwrap_or(store.commit_seq)
    }

    fn conflict(&self, sql: &str, table: &str, key: &str) -> Error {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection = self.id, table, key, "Serialization conflict");
        Error::Query(
            QueryError::serialization("could not serialize access due to concurrent update")
                .with_sql(sql),
        )
    }

    /// Rows of `table` as this connection sees them, by primary key.
    fn visible(&self, store: &Store, sql: &str, table: &str) -> Result<BTreeMap<String, Vec<Value>>> {
        let mut rows = store.table(sql, table)?.committed_rows(self.snapshot(store));
        for ((name, key), values) in &self.writes {
            if name != table {
                continue;
            }
            match values {
                Some(values) => {
                    rows.insert(key.clone(), values.clone());
                }
                None => {
                    rows.remove(key);
                }
            }
        }
        Ok(rows)
    }

    /// Take the write lock on a row, failing if another connection holds
    /// it or committed a newer version since the snapshot.
    fn claim(&self, store: &mut Store, sql: &str, table: &str, key: &str) -> Result<()> {
        let id = (table.to_string(), key.to_string());
        if store.locks.get(&id).is_some_and(|&owner| owner != self.id) {
            return Err(self.conflict(sql, table, key));
        }
        let snapshot = self.snapshot(store);
        if store
            .table(sql, table)?
            .latest(key)
            .is_some_and(|version| version.seq > snapshot)
        {
            return Err(self.conflict(sql, table, key));
        }
        store.locks.insert(id, self.id);
        Ok(())
    }

    fn insert(
        &mut self,
        store: &mut Store,
        sql: &str,
        table_name: &str,
        columns: &[String],
        values: Vec<Value>,
    ) -> Result<u64> {
        if store.views.contains_key(table_name) {
            return Err(query_error(
                QueryErrorKind::Database,
                "55000",
                sql,
                format!("cannot insert into view \"{}\"", table_name),
            ));
        }
        let table = store.table(sql, table_name)?;
        let mut row: Vec<Value> = table.columns.iter().map(|c| c.default.clone()).collect();
        for (column, value) in columns.iter().zip(values) {
            row[table.index_of(sql, column)?] = value;
        }
        let key = table.key_of(&row).ok_or_else(|| {
            query_error(
                QueryErrorKind::Constraint,
                "23502",
                sql,
                format!("null value in primary key of \"{}\"", table_name),
            )
        })?;
        if self.visible(store, sql, table_name)?.contains_key(&key) {
            return Err(query_error(
                QueryErrorKind::Constraint,
                "23505",
                sql,
                format!("duplicate key value violates primary key of \"{}\"", table_name),
            ));
        }
        self.claim(store, sql, table_name, &key)?;
        self.writes.insert((table_name.to_string(), key), Some(row));
        Ok(1)
    }

    fn matching(
        &self,
        store: &Store,
        sql: &str,
        table_name: &str,
        filter: &[Condition],
    ) -> Result<Vec<(String, Vec<Value>)>> {
        let table = store.table(sql, table_name)?;
        let tests = filter
            .iter()
            .map(|c| Ok((table.index_of(sql, &c.column)?, c)))
            .collect::<Result<Vec<_>>>()?;
        Ok(self
            .visible(store, sql, table_name)?
            .into_iter()
            .filter(|(_, row)| tests.iter().all(|(i, c)| c.matches(&row[*i])))
            .collect())
    }

    fn update(
        &mut self,
        store: &mut Store,
        sql: &str,
        table_name: &str,
        assignments: &[(String, Expr)],
        filter: &[Condition],
    ) -> Result<u64> {
        let matched = self.matching(store, sql, table_name, filter)?;
        let table = store.table(sql, table_name)?;
        let targets = assignments
            .iter()
            .map(|(column, expr)| Ok((table.index_of(sql, column)?, expr)))
            .collect::<Result<Vec<_>>>()?;
        let mut changed = Vec::with_capacity(matched.len());
        for (key, old) in matched {
            let mut new = old.clone();
            for (index, expr) in &targets {
                new[*index] = match expr {
                    Expr::Value(value) => value.clone(),
                    Expr::Column(column) => old[table.index_of(sql, column)?].clone(),
                    Expr::Offset(column, n) => {
                        let current = &old[table.index_of(sql, column)?];
                        match current.as_i64() {
                            Some(v) => Value::BigInt(v + n),
                            None => Value::Null,
                        }
                    }
                };
            }
            let new_key = table.key_of(&new).ok_or_else(|| {
                query_error(
                    QueryErrorKind::Constraint,
                    "23502",
                    sql,
                    format!("null value in primary key of \"{}\"", table_name),
                )
            })?;
            changed.push((key, new_key, new));
        }
        let count = changed.len() as u64;
        for (key, new_key, new) in changed {
            self.claim(store, sql, table_name, &key)?;
            if new_key != key {
                self.claim(store, sql, table_name, &new_key)?;
                self.writes.insert((table_name.to_string(), key), None);
            }
            self.writes.insert((table_name.to_string(), new_key), Some(new));
        }
        Ok(count)
    }

    fn delete(
        &mut self,
        store: &mut Store,
        sql: &str,
        table_name: &str,
        filter: &[Condition],
    ) -> Result<u64> {
        let matched = self.matching(store, sql, table_name, filter)?;
        let count = matched.len() as u64;
        for (key, _) in matched {
            self.claim(store, sql, table_name, &key)?;
            self.writes.insert((table_name.to_string(), key), None);
        }
        Ok(count)
    }

    fn select(&mut self, store: &mut Store, sql: &str, select: &Select) -> Result<Vec<Row>> {
        let (columns, rows) = self.evaluate(store, sql, select)?;
        if select.for_update {
            for (key, _) in &rows {
                let key = key.as_deref().ok_or_else(|| {
                    query_error(
                        QueryErrorKind::Database,
                        "0A000",
                        sql,
                        "FOR UPDATE is not allowed with views".to_string(),
                    )
                })?;
                self.claim(store, sql, &select.from, key)?;
            }
        }
        let (names, rows) = project(sql, &columns, rows.into_iter().map(|(_, r)| r).collect(), &select.what)?;
        let names = column_info(&names);
        Ok(rows
            .into_iter()
            .map(|values| Row::with_columns(Arc::clone(&names), values))
            .collect())
    }

    /// Filter, order and slice the rows of a table or view. Table rows carry
    /// their key.
    fn evaluate(
        &self,
        store: &Store,
        sql: &str,
        select: &Select,
    ) -> Result<(Vec<ColumnDef>, Vec<(Option<String>, Vec<Value>)>)> {
        let (columns, mut rows) = self.scan(store, sql, &select.from)?;
        let position = |column: &str| {
            columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(column))
                .ok_or_else(|| undefined_column(sql, column))
        };
        for condition in &select.filter {
            let index = position(&condition.column)?;
            rows.retain(|(_, row)| condition.matches(&row[index]));
        }
        if !select.order.is_empty() {
            let order = select
                .order
                .iter()
                .map(|(column, descending)| Ok((position(column)?, *descending)))
                .collect::<Result<Vec<_>>>()?;
            rows.sort_by(|(_, a), (_, b)| {
                order
                    .iter()
                    .map(|&(i, descending)| {
                        let ordering = sql::compare(&a[i], &b[i]).unwrap_or_else(|| {
                            // NULLs sort last
                            a[i].is_null().cmp(&b[i].is_null())
                        });
                        if descending { ordering.reverse() } else { ordering }
                    })
                    .find(|o| o.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        let rows = rows
            .into_iter()
            .skip(select.offset.unwrap_or(0))
            .take(select.limit.unwrap_or(usize::MAX))
            .collect();
        Ok((columns, rows))
    }

    fn scan(
        &self,
        store: &Store,
        sql: &str,
        from: &str,
    ) -> Result<(Vec<ColumnDef>, Vec<(Option<String>, Vec<Value>)>)> {
        if let Some(query) = store.views.get(from) {
            let Statement::Select(inner) = sql::parse(query, &[])? else {
                return Err(sql::syntax_error(query, "view is not a query"));
            };
            let (columns, rows) = self.evaluate(store, query, &inner)?;
            let (names, rows) = project(
                query,
                &columns,
                rows.into_iter().map(|(_, r)| r).collect(),
                &inner.what,
            )?;
            return Ok((names, rows.into_iter().map(|r| (None, r)).collect()));
        }
        let columns = store.table(sql, from)?.columns.clone();
        let rows = self
            .visible(store, sql, from)?
            .into_iter()
            .map(|(key, row)| (Some(key), row))
            .collect();
        Ok((columns, rows))
    }

    fn finish(&mut self) {
        let mut store = lock_store(&self.store);
        store.release(self.id);
        self.writes.clear();
        self.snapshot = None;
    }
}

fn project(
    sql: &str,
    columns: &[ColumnDef],
    rows: Vec<Vec<Value>>,
    what: &[Projection],
) -> Result<(Vec<ColumnDef>, Vec<Vec<Value>>)> {
    if matches!(what, [Projection::Count]) {
        let count = i64::try_from(rows.len()).unwrap_or(i64::MAX);
        let column = ColumnDef {
            name: "count".to_string(),
            sql_type: Some("BIGINT".to_string()),
            default: Value::Null,
        };
        return Ok((vec![column], vec![vec![Value::BigInt(count)]]));
    }
    let mut names = Vec::new();
    let mut indexes = Vec::new();
    for item in what {
        match item {
            Projection::Star => {
                names.extend(columns.iter().cloned());
                indexes.extend(0..columns.len());
            }
            Projection::Count => {
                return Err(sql::syntax_error(sql, "COUNT(*) cannot be mixed with columns"));
            }
            Projection::Column(name) => {
                let index = columns
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(name))
                    .ok_or_else(|| undefined_column(sql, name))?;
                names.push(columns[index].clone());
                indexes.push(index);
            }
        }
    }
    let rows = rows
        .into_iter()
        .map(|row| indexes.iter().map(|&i| row[i].clone()).collect())
        .collect();
    Ok((names, rows))
}

impl Connection for MemoryConnection {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        match self.run(sql, params)? {
            Outcome::Rows(rows) => Ok(rows),
            Outcome::Affected(_) => Ok(Vec::new()),
        }
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        match self.run(sql, params)? {
            Outcome::Rows(rows) => Ok(rows.len() as u64),
            Outcome::Affected(n) => Ok(n),
        }
    }

    fn commit(&mut self) -> Result<()> {
        let writes = std::mem::take(&mut self.writes);
        if !writes.is_empty() {
            let mut store = lock_store(&self.store);
            store.commit_seq += 1;
            let seq = store.commit_seq;
            for ((table, key), values) in writes {
                // The table may have been dropped meanwhile.
                if let Some(table) = store.tables.get_mut(&table) {
                    table
                        .rows
                        .entry(key)
                        .or_default()
                        .push(Version { seq, values });
                }
            }
            tracing::trace!(connection = self.id, seq, "Committed");
        }
        self.finish();
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        tracing::trace!(connection = self.id, writes = self.writes.len(), "Rolled back");
        self.finish();
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.finish();
    }
}
