//! Generic filter/sort/paginate/populate engine shared by every list endpoint.
//!
//! Tables are described by a [`Collection`]: each field has a SQL column, a
//! document key (camelCase, optionally dotted to nest, e.g. `stats.likes`) and
//! a kind that decides how the column is decoded into JSON. Queries speak in
//! document keys only; column names and table names never come from callers,
//! and every value is a bound parameter.
//!
//! A page is produced in three steps:
//!
//! 1. `COUNT(*)` under the filter gives `totalItems`.
//! 2. The `[(page-1)*limit, page*limit)` slice is read under the sort, with
//!    `rowid` appended as the insertion-order tie-breaker.
//! 3. Each [`Populate`] spec gathers the referenced ids on the page, resolves
//!    them in one batched `IN (...)` query and inlines the selected foreign
//!    fields in place of the id.

use std::collections::{BTreeSet, HashMap};

use krishi_types::api::{Page, Pagination};
use rusqlite::Connection;
use rusqlite::types::{Value, ValueRef};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use crate::error::{DomainError, Result};

pub const DEFAULT_LIMIT: u32 = 20;
pub const MESSAGE_LIMIT: u32 = 50;
pub const MAX_LIMIT: u32 = 100;

/// A materialized record: a JSON object keyed by document keys.
pub type Document = JsonValue;

// -- Schema description --

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Real,
    Bool,
    /// TEXT column holding a JSON document or array
    Json,
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub column: &'static str,
    pub key: &'static str,
    pub kind: FieldKind,
}

impl Field {
    pub const fn new(column: &'static str, key: &'static str, kind: FieldKind) -> Self {
        Self { column, key, kind }
    }
}

#[derive(Debug)]
pub struct Collection {
    pub table: &'static str,
    pub fields: &'static [Field],
}

impl Collection {
    fn field(&self, key: &str) -> Result<&Field> {
        self.fields
            .iter()
            .find(|f| f.key == key)
            .ok_or_else(|| DomainError::Internal(anyhow::anyhow!("{} has no field '{}'", self.table, key)))
    }

    fn column(&self, key: &str) -> Result<String> {
        let field = self.field(key)?;
        Ok(format!("{}.{}", self.table, field.column))
    }
}

// -- Filters --

/// Predicate tree over document keys.
#[derive(Debug, Clone)]
pub enum Filter {
    All,
    Eq(&'static str, Value),
    Ne(&'static str, Value),
    Gt(&'static str, Value),
    Gte(&'static str, Value),
    Lt(&'static str, Value),
    Lte(&'static str, Value),
    In(&'static str, Vec<Value>),
    IsNull(&'static str),
    /// Case-insensitive substring match
    Contains(&'static str, String),
    /// JSON array column has a member equal to `value`, or whose `path`
    /// sub-field equals `value` when `path` is set.
    ArrayContains {
        field: &'static str,
        path: Option<&'static str>,
        value: Value,
    },
    /// Insertion order: the row's `rowid` is below the given one
    RowidLt(i64),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(key: &'static str, value: impl Into<Value>) -> Self {
        Self::Eq(key, value.into())
    }

    pub fn ne(key: &'static str, value: impl Into<Value>) -> Self {
        Self::Ne(key, value.into())
    }

    pub fn gt(key: &'static str, value: impl Into<Value>) -> Self {
        Self::Gt(key, value.into())
    }

    pub fn lt(key: &'static str, value: impl Into<Value>) -> Self {
        Self::Lt(key, value.into())
    }

    pub fn is_in<I, V>(key: &'static str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::In(key, values.into_iter().map(Into::into).collect())
    }

    pub fn contains(key: &'static str, needle: impl Into<String>) -> Self {
        Self::Contains(key, needle.into())
    }

    pub fn array_contains(key: &'static str, value: impl Into<Value>) -> Self {
        Self::ArrayContains {
            field: key,
            path: None,
            value: value.into(),
        }
    }

    pub fn array_member(key: &'static str, path: &'static str, value: impl Into<Value>) -> Self {
        Self::ArrayContains {
            field: key,
            path: Some(path),
            value: value.into(),
        }
    }

    /// Keyset cursor for a descending `key` sort with the `rowid` tie-break:
    /// rows strictly after (`value`, `rowid`) in that order.
    pub fn before(key: &'static str, value: impl Into<Value>, rowid: i64) -> Self {
        let value = value.into();
        Self::or([
            Self::Lt(key, value.clone()),
            Self::and([Self::Eq(key, value), Self::RowidLt(rowid)]),
        ])
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::And(filters.into_iter().collect())
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::Or(filters.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Self::Not(Box::new(filter))
    }

    fn to_sql(&self, coll: &Collection, params: &mut Vec<Value>) -> Result<String> {
        match self {
            Filter::All => Ok("1".into()),
            Filter::Eq(k, v) => compare(coll, k, "=", v, params),
            Filter::Ne(k, v) => compare(coll, k, "IS NOT", v, params),
            Filter::Gt(k, v) => compare(coll, k, ">", v, params),
            Filter::Gte(k, v) => compare(coll, k, ">=", v, params),
            Filter::Lt(k, v) => compare(coll, k, "<", v, params),
            Filter::Lte(k, v) => compare(coll, k, "<=", v, params),
            Filter::In(k, values) => {
                if values.is_empty() {
                    return Ok("0".into());
                }
                params.extend(values.iter().cloned());
                Ok(format!("{} IN ({})", coll.column(k)?, placeholders(values.len())))
            }
            Filter::IsNull(k) => Ok(format!("{} IS NULL", coll.column(k)?)),
            Filter::Contains(k, needle) => {
                params.push(Value::Text(escape_like(&needle.to_lowercase())));
                Ok(format!(
                    "LOWER({}) LIKE '%' || ? || '%' ESCAPE '\\'",
                    coll.column(k)?
                ))
            }
            Filter::ArrayContains { field, path, value } => {
                let column = coll.column(field)?;
                match path {
                    Some(path) => {
                        params.push(Value::Text(format!("$.{}", path)));
                        params.push(value.clone());
                        Ok(format!(
                            "EXISTS (SELECT 1 FROM json_each({}) je WHERE json_extract(je.value, ?) = ?)",
                            column
                        ))
                    }
                    None => {
                        params.push(value.clone());
                        Ok(format!("EXISTS (SELECT 1 FROM json_each({}) je WHERE je.value = ?)", column))
                    }
                }
            }
            Filter::RowidLt(rowid) => {
                params.push(Value::Integer(*rowid));
                Ok(format!("{}.rowid < ?", coll.table))
            }
            Filter::And(parts) => join(parts, " AND ", "1", coll, params),
            Filter::Or(parts) => join(parts, " OR ", "0", coll, params),
            Filter::Not(inner) => Ok(format!("NOT ({})", inner.to_sql(coll, params)?)),
        }
    }
}

fn compare(coll: &Collection, key: &str, op: &str, value: &Value, params: &mut Vec<Value>) -> Result<String> {
    params.push(value.clone());
    Ok(format!("{} {} ?", coll.column(key)?, op))
}

fn join(parts: &[Filter], sep: &str, empty: &str, coll: &Collection, params: &mut Vec<Value>) -> Result<String> {
    if parts.is_empty() {
        return Ok(empty.into());
    }
    let sql = parts
        .iter()
        .map(|p| p.to_sql(coll, params))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("({})", sql.join(sep)))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// -- Sorting, projection, population --

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    fn as_sql(self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Sort {
    pub key: &'static str,
    pub order: Order,
}

impl Sort {
    pub fn asc(key: &'static str) -> Self {
        Self { key, order: Order::Asc }
    }

    pub fn desc(key: &'static str) -> Self {
        Self { key, order: Order::Desc }
    }
}

/// Which fields to materialize. Selectors match a key exactly or as a dotted
/// prefix, so `stats` selects every `stats.*` field. `id` is always included.
#[derive(Debug, Clone, Copy, Default)]
pub enum Projection {
    #[default]
    All,
    Include(&'static [&'static str]),
    Exclude(&'static [&'static str]),
}

impl Projection {
    fn keeps(&self, field: &Field) -> bool {
        let matches = |sel: &str| {
            field.key == sel
                || field
                    .key
                    .strip_prefix(sel)
                    .is_some_and(|rest| rest.starts_with('.'))
        };
        match self {
            Projection::All => true,
            _ if field.key == "id" => true,
            Projection::Include(sel) => sel.iter().any(|s| matches(s)),
            Projection::Exclude(sel) => !sel.iter().any(|s| matches(s)),
        }
    }
}

/// Relation expansion: replace the id found at `path` with the referenced
/// document (restricted to `select`). Paths walk through objects and arrays,
/// e.g. `participants.user` expands every participant.
#[derive(Debug, Clone, Copy)]
pub struct Populate {
    pub path: &'static str,
    pub from: &'static Collection,
    pub select: &'static [&'static str],
}

impl Populate {
    pub fn new(path: &'static str, from: &'static Collection, select: &'static [&'static str]) -> Self {
        Self { path, from, select }
    }
}

// -- Query --

#[derive(Debug, Clone)]
pub struct Query {
    collection: &'static Collection,
    filter: Filter,
    sort: Vec<Sort>,
    projection: Projection,
    populate: Vec<Populate>,
}

impl Query {
    pub fn new(collection: &'static Collection) -> Self {
        Self {
            collection,
            filter: Filter::All,
            sort: Vec::new(),
            projection: Projection::All,
            populate: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn select(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn populate(mut self, populate: Populate) -> Self {
        self.populate.push(populate);
        self
    }

    fn where_clause(&self, params: &mut Vec<Value>) -> Result<String> {
        self.filter.to_sql(self.collection, params)
    }

    fn order_clause(&self) -> Result<String> {
        let coll = self.collection;
        let mut terms = self
            .sort
            .iter()
            .map(|s| Ok(format!("{} {}", coll.column(s.key)?, s.order.as_sql())))
            .collect::<Result<Vec<_>>>()?;
        let tie = self.sort.first().map_or(Order::Asc, |s| s.order);
        terms.push(format!("{}.rowid {}", coll.table, tie.as_sql()));
        Ok(terms.join(", "))
    }
}

/// Clamped paging parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    /// `page` below 1 becomes 1; a missing or non-positive `limit` becomes
    /// `default_limit`; anything above [`MAX_LIMIT`] is capped.
    pub fn new(page: Option<i64>, limit: Option<i64>, default_limit: u32) -> Self {
        let page = page.unwrap_or(1).clamp(1, u32::MAX as i64) as u32;
        let limit = match limit {
            Some(l) if l > 0 => l.min(MAX_LIMIT as i64) as u32,
            _ => default_limit.clamp(1, MAX_LIMIT),
        };
        Self { page, limit }
    }

    pub fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.limit as u64
    }

    fn meta(&self, total_items: u64) -> Pagination {
        let limit = self.limit as u64;
        let total_pages = total_items.div_ceil(limit);
        Pagination {
            page: self.page,
            limit: self.limit,
            total_items,
            total_pages,
            has_next: (self.page as u64) < total_pages,
            has_prev: self.page > 1,
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None, DEFAULT_LIMIT)
    }
}

// -- Execution --

pub fn count(conn: &Connection, query: &Query) -> Result<u64> {
    let mut params = Vec::new();
    let where_sql = query.where_clause(&mut params)?;
    let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", query.collection.table, where_sql);
    let n: i64 = conn.query_row(&sql, rusqlite::params_from_iter(params.iter()), |r| r.get(0))?;
    Ok(n as u64)
}

pub fn paginate(conn: &Connection, query: &Query, page: PageRequest) -> Result<Page<Document>> {
    let total_items = count(conn, query)?;
    let pagination = page.meta(total_items);

    let data = if page.offset() >= total_items {
        Vec::new()
    } else {
        fetch(conn, query, Some((page.limit as u64, page.offset())))?
    };

    Ok(Page { data, pagination })
}

pub fn paginate_as<T: DeserializeOwned>(conn: &Connection, query: &Query, page: PageRequest) -> Result<Page<T>> {
    let page = paginate(conn, query, page)?;
    let data = page
        .data
        .into_iter()
        .map(serde_json::from_value)
        .collect::<std::result::Result<Vec<T>, _>>()?;
    Ok(Page {
        data,
        pagination: page.pagination,
    })
}

/// First document matching the query, fully materialized.
pub fn find_one(conn: &Connection, query: &Query) -> Result<Option<Document>> {
    Ok(fetch(conn, query, Some((1, 0)))?.into_iter().next())
}

pub fn find_one_as<T: DeserializeOwned>(conn: &Connection, query: &Query) -> Result<Option<T>> {
    find_one(conn, query)?
        .map(serde_json::from_value)
        .transpose()
        .map_err(Into::into)
}

fn fetch(conn: &Connection, query: &Query, window: Option<(u64, u64)>) -> Result<Vec<Document>> {
    let coll = query.collection;
    let fields: Vec<&Field> = coll.fields.iter().filter(|f| query.projection.keeps(f)).collect();

    let mut params = Vec::new();
    let where_sql = query.where_clause(&mut params)?;
    let mut sql = format!(
        "SELECT {} FROM {} WHERE {} ORDER BY {}",
        select_list(coll, &fields),
        coll.table,
        where_sql,
        query.order_clause()?
    );
    if let Some((limit, offset)) = window {
        sql.push_str(" LIMIT ? OFFSET ?");
        params.push(Value::Integer(limit as i64));
        params.push(Value::Integer(offset as i64));
    }

    let mut docs = read_documents(conn, &sql, &params, &fields)?;
    for spec in &query.populate {
        populate(conn, &mut docs, spec)?;
    }
    Ok(docs)
}

fn select_list(coll: &Collection, fields: &[&Field]) -> String {
    fields
        .iter()
        .map(|f| format!("{}.{}", coll.table, f.column))
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_documents(conn: &Connection, sql: &str, params: &[Value], fields: &[&Field]) -> Result<Vec<Document>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;

    let mut docs = Vec::new();
    while let Some(row) = rows.next()? {
        let mut doc = Map::new();
        for (i, field) in fields.iter().enumerate() {
            let value = decode(row.get_ref(i)?, field);
            insert_path(&mut doc, field.key, value);
        }
        docs.push(JsonValue::Object(doc));
    }
    Ok(docs)
}

fn decode(raw: ValueRef<'_>, field: &Field) -> JsonValue {
    match (raw, field.kind) {
        (ValueRef::Null, _) => JsonValue::Null,
        (ValueRef::Integer(i), FieldKind::Bool) => JsonValue::Bool(i != 0),
        (ValueRef::Integer(i), FieldKind::Real) => JsonValue::from(i as f64),
        (ValueRef::Integer(i), _) => JsonValue::from(i),
        (ValueRef::Real(f), _) => JsonValue::from(f),
        (ValueRef::Text(t), FieldKind::Json) => serde_json::from_slice(t).unwrap_or_else(|e| {
            warn!("Corrupt JSON in column '{}': {}", field.column, e);
            JsonValue::Null
        }),
        (ValueRef::Text(t), _) => JsonValue::String(String::from_utf8_lossy(t).into_owned()),
        (ValueRef::Blob(_), _) => JsonValue::Null,
    }
}

/// Insert under a possibly dotted key, creating intermediate objects.
fn insert_path(doc: &mut Map<String, JsonValue>, key: &str, value: JsonValue) {
    match key.split_once('.') {
        None => {
            doc.insert(key.to_string(), value);
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_string())
                .or_insert_with(|| JsonValue::Object(Map::new()));
            if let JsonValue::Object(map) = child {
                insert_path(map, rest, value);
            }
        }
    }
}

fn populate(conn: &Connection, docs: &mut [Document], spec: &Populate) -> Result<()> {
    let segments: Vec<&str> = spec.path.split('.').collect();

    let mut ids = BTreeSet::new();
    for doc in docs.iter() {
        collect_refs(doc, &segments, &mut ids);
    }
    if ids.is_empty() {
        return Ok(());
    }

    let from = spec.from;
    let projection = Projection::Include(spec.select);
    let fields: Vec<&Field> = from.fields.iter().filter(|f| projection.keeps(f)).collect();
    let id_column = from.field("id")?.column;
    let sql = format!(
        "SELECT {} FROM {} WHERE {}.{} IN ({})",
        select_list(from, &fields),
        from.table,
        from.table,
        id_column,
        placeholders(ids.len())
    );
    let params: Vec<Value> = ids.into_iter().map(Value::Text).collect();

    let lookup: HashMap<String, Document> = read_documents(conn, &sql, &params, &fields)?
        .into_iter()
        .filter_map(|doc| {
            let id = doc.get("id")?.as_str()?.to_string();
            Some((id, doc))
        })
        .collect();

    for doc in docs.iter_mut() {
        inline_refs(doc, &segments, &lookup);
    }
    Ok(())
}

fn collect_refs(value: &JsonValue, segments: &[&str], out: &mut BTreeSet<String>) {
    match value {
        JsonValue::Array(items) => items.iter().for_each(|v| collect_refs(v, segments, out)),
        JsonValue::String(id) if segments.is_empty() => {
            out.insert(id.clone());
        }
        JsonValue::Object(map) => {
            if let Some((head, rest)) = segments.split_first() {
                if let Some(child) = map.get(*head) {
                    collect_refs(child, rest, out);
                }
            }
        }
        _ => {}
    }
}

fn inline_refs(value: &mut JsonValue, segments: &[&str], lookup: &HashMap<String, Document>) {
    match value {
        JsonValue::Array(items) => items.iter_mut().for_each(|v| inline_refs(v, segments, lookup)),
        JsonValue::String(id) if segments.is_empty() => {
            // Dangling references keep the bare id.
            if let Some(doc) = lookup.get(id.as_str()) {
                *value = doc.clone();
            }
        }
        JsonValue::Object(map) => {
            if let Some((head, rest)) = segments.split_first() {
                if let Some(child) = map.get_mut(*head) {
                    inline_refs(child, rest, lookup);
                }
            }
        }
        _ => {}
    }
}
