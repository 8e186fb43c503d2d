/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A small, storage-agnostic filter/order/limit description that both the
//! in-memory reference `Dao` and an `HttpAdapter::find_all` implementation
//! can interpret without this crate knowing anything about SQL or query
//! strings on either end.

use serde_json::Value;

#[derive(Debug, Clone)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Contains(String, String),
    StartsWith(String, String),
    EndsWith(String, String),
    InList(String, Vec<Value>),
    IsNull(String),
    IsNotNull(String),
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Evaluates this query's filters and ordering against an in-memory
    /// JSON view of rows. Used by the reference `Dao` implementation; a
    /// real generated DAO would normally translate `Query` into SQL instead.
    pub fn apply(&self, rows: Vec<Value>) -> Vec<Value> {
        let mut rows: Vec<Value> = rows
            .into_iter()
            .filter(|row| self.filters.iter().all(|f| matches(f, row)))
            .collect();

        if !self.order_by.is_empty() {
            rows.sort_by(|a, b| {
                for ob in &self.order_by {
                    let av = a.get(&ob.field);
                    let bv = b.get(&ob.field);
                    let ord = compare_values(av, bv);
                    let ord = if ob.descending { ord.reverse() } else { ord };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }

        let rows = if let Some(offset) = self.offset {
            rows.into_iter().skip(offset).collect()
        } else {
            rows
        };

        if let Some(limit) = self.limit {
            rows.into_iter().take(limit).collect()
        } else {
            rows
        }
    }
}

fn matches(filter: &Filter, row: &Value) -> bool {
    match filter {
        Filter::Eq(f, v) => row.get(f) == Some(v),
        Filter::Ne(f, v) => row.get(f) != Some(v),
        Filter::Gt(f, v) => compare_values(row.get(f), Some(v)) == std::cmp::Ordering::Greater,
        Filter::Ge(f, v) => compare_values(row.get(f), Some(v)) != std::cmp::Ordering::Less,
        Filter::Lt(f, v) => compare_values(row.get(f), Some(v)) == std::cmp::Ordering::Less,
        Filter::Le(f, v) => compare_values(row.get(f), Some(v)) != std::cmp::Ordering::Greater,
        Filter::Contains(f, s) => as_str(row, f).is_some_and(|x| x.contains(s.as_str())),
        Filter::StartsWith(f, s) => as_str(row, f).is_some_and(|x| x.starts_with(s.as_str())),
        Filter::EndsWith(f, s) => as_str(row, f).is_some_and(|x| x.ends_with(s.as_str())),
        Filter::InList(f, list) => row.get(f).is_some_and(|v| list.contains(v)),
        Filter::IsNull(f) => row.get(f).is_none_or(|v| v.is_null()),
        Filter::IsNotNull(f) => row.get(f).is_some_and(|v| !v.is_null()),
    }
}

fn as_str<'a>(row: &'a Value, field: &str) -> Option<&'a str> {
    row.get(field).and_then(Value::as_str)
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}
