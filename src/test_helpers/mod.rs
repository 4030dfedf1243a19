//! # Test Helpers
//!
//! Scriptable in-memory database driver. Lets unit and integration tests
//! simulate refused connections, dead idle connections and lost queries
//! without a real database.

use crate::database::{ConnectionError, ConnectionFactory, ConnectionResult, DatabaseConnection};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    connects: AtomicU64,
    closes: AtomicU64,
    resets: AtomicU64,
    fail_connects: AtomicU32,
    fail_pings: AtomicU32,
    execute_failures: Mutex<VecDeque<ConnectionError>>,
    fetch_failures: Mutex<VecDeque<ConnectionError>>,
    statements: Mutex<Vec<String>>,
    rows: Mutex<Option<Vec<Value>>>,
    latency: Mutex<Option<Duration>>,
}

/// Connection factory whose behavior tests script up front
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` connect attempts fail with "Can't connect to MySQL server"
    pub fn fail_next_connects(&self, n: u32) {
        self.state.fail_connects.store(n, Ordering::SeqCst);
    }

    /// The next `n` liveness checks fail
    pub fn fail_next_pings(&self, n: u32) {
        self.state.fail_pings.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_executes_with(&self, error: ConnectionError) {
        self.state.execute_failures.lock().push_back(error);
    }

    pub fn fail_next_fetches_with(&self, error: ConnectionError) {
        self.state.fetch_failures.lock().push_back(error);
    }

    /// Rows returned by every subsequent fetch
    pub fn set_rows(&self, rows: Vec<Value>) {
        *self.state.rows.lock() = Some(rows);
    }

    /// Delay applied to every execute and fetch
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock() = Some(latency);
    }

    pub fn connects(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> u64 {
        self.state.resets.load(Ordering::SeqCst)
    }

    /// Every statement executed or fetched, in order
    pub fn statements(&self) -> Vec<String> {
        self.state.statements.lock().clone()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ConnectionFactory for MockConnector {
    async fn connect(&self) -> ConnectionResult<Box<dyn DatabaseConnection>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.state.fail_connects) {
            return Err(ConnectionError::Connect(
                "Can't connect to MySQL server on 'db' (111 Connection refused)".to_string(),
            ));
        }
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            open: true,
        }))
    }

    fn describe(&self) -> String {
        "mock://restaurant".to_string()
    }
}

/// Connection handed out by [`MockConnector`]
#[derive(Debug)]
pub struct MockConnection {
    state: Arc<MockState>,
    open: bool,
}

impl MockConnection {
    async fn simulate_latency(&self) {
        let latency = *self.state.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl DatabaseConnection for MockConnection {
    async fn ping(&mut self) -> ConnectionResult<()> {
        if !self.open {
            return Err(ConnectionError::Closed);
        }
        if take_one(&self.state.fail_pings) {
            return Err(ConnectionError::Lost("MySQL server has gone away".to_string()));
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> ConnectionResult<u64> {
        self.simulate_latency().await;
        self.state.statements.lock().push(sql.to_string());
        let failure = self.state.execute_failures.lock().pop_front();
        match failure {
            Some(err) => Err(err),
            None => Ok(1),
        }
    }

    async fn fetch(&mut self, sql: &str) -> ConnectionResult<Vec<Value>> {
        self.simulate_latency().await;
        self.state.statements.lock().push(sql.to_string());
        let failure = self.state.fetch_failures.lock().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        let rows = self.state.rows.lock().clone();
        Ok(rows.unwrap_or_else(|| vec![json!({ "1": 1 })]))
    }

    async fn reset(&mut self) -> ConnectionResult<()> {
        self.state.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
