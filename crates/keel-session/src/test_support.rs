//! Scripted connection for unit tests.

#![allow(clippy::manual_async_fn)] // Mock trait impls must match trait signatures

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use keel_core::{Connection, Dialect, Error, Row, Value};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Drive `future` to completion on a fresh current-thread runtime.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(future)
}

pub(crate) fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

/// One-column row holding an integer.
pub(crate) fn int_row(column: &str, value: i64) -> Row {
    Row::new(vec![column.to_string()], vec![Value::BigInt(value)])
}

#[derive(Debug, Default)]
pub(crate) struct MockState {
    /// Every statement sent through `execute`, `insert` or `batch`.
    pub executed: Vec<(String, Vec<Value>)>,
    /// Every query sent through `query` or `query_one`.
    pub queries: Vec<(String, Vec<Value>)>,
    /// Scripted query results, matched by SQL substring.
    pub results: Vec<(String, VecDeque<Vec<Row>>)>,
    /// Scripted row counts, matched by SQL substring. Unmatched statements affect 1 row.
    pub counts: Vec<(String, VecDeque<u64>)>,
    /// Next key handed out by `insert`.
    pub next_key: i64,
    /// Number of `batch` calls.
    pub batches: usize,
}

impl MockState {
    fn result_for(&mut self, sql: &str) -> Vec<Row> {
        self.results
            .iter_mut()
            .find(|(pattern, queue)| sql.contains(pattern.as_str()) && !queue.is_empty())
            .and_then(|(_, queue)| queue.pop_front())
            .unwrap_or_default()
    }

    fn count_for(&mut self, sql: &str) -> u64 {
        self.counts
            .iter_mut()
            .find(|(pattern, queue)| sql.contains(pattern.as_str()) && !queue.is_empty())
            .and_then(|(_, queue)| queue.pop_front())
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockConnection {
    state: Arc<Mutex<MockState>>,
    dialect: Dialect,
}

impl MockConnection {
    pub(crate) fn new() -> Self {
        Self::with_dialect(Dialect::Postgres)
    }

    pub(crate) fn with_dialect(dialect: Dialect) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_key: 1,
                ..MockState::default()
            })),
            dialect,
        }
    }

    /// Queue `rows` as the result of the next query containing `pattern`.
    pub(crate) fn respond(&self, pattern: &str, rows: Vec<Row>) {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some((_, queue)) = state.results.iter_mut().find(|(p, _)| p == pattern) {
            queue.push_back(rows);
        } else {
            state
                .results
                .push((pattern.to_string(), VecDeque::from([rows])));
        }
    }

    /// Queue `count` as the row count of the next statement containing `pattern`.
    pub(crate) fn affect(&self, pattern: &str, count: u64) {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some((_, queue)) = state.counts.iter_mut().find(|(p, _)| p == pattern) {
            queue.push_back(count);
        } else {
            state
                .counts
                .push((pattern.to_string(), VecDeque::from([count])));
        }
    }

    /// Key returned by the next identity insert.
    pub(crate) fn set_next_key(&self, key: i64) {
        self.state.lock().expect("lock poisoned").next_key = key;
    }

    pub(crate) fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().expect("lock poisoned").executed.clone()
    }

    /// Executed SQL, without transaction control statements.
    pub(crate) fn statements(&self) -> Vec<String> {
        self.executed()
            .into_iter()
            .map(|(sql, _)| sql)
            .filter(|sql| !matches!(sql.as_str(), "BEGIN" | "COMMIT" | "ROLLBACK"))
            .collect()
    }

    pub(crate) fn queries(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().expect("lock poisoned").queries.clone()
    }

    pub(crate) fn batches(&self) -> usize {
        self.state.lock().expect("lock poisoned").batches
    }
}

impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let rows = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.queries.push((sql.to_string(), params.to_vec()));
            state.result_for(sql)
        };
        async move { Outcome::Ok(rows) }
    }

    fn query_one(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let row = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.queries.push((sql.to_string(), params.to_vec()));
            state.result_for(sql).into_iter().next()
        };
        async move { Outcome::Ok(row) }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let count = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.executed.push((sql.to_string(), params.to_vec()));
            state.count_for(sql)
        };
        async move { Outcome::Ok(count) }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let key = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.executed.push((sql.to_string(), params.to_vec()));
            let key = state.next_key;
            state.next_key += 1;
            key
        };
        async move { Outcome::Ok(key) }
    }

    fn batch(
        &self,
        _cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        let counts = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.batches += 1;
            statements
                .iter()
                .map(|(sql, params)| {
                    state.executed.push((sql.clone(), params.clone()));
                    state.count_for(sql)
                })
                .collect::<Vec<_>>()
        };
        async move { Outcome::Ok(counts) }
    }
}
