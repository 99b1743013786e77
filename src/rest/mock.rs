//! In-memory platform for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{OrgContext, PlatformApi, RestError, Result};

#[derive(Default)]
struct MockState {
    responses: HashMap<String, Value>,
    gets: Vec<String>,
    posts: Vec<(String, Value)>,
    connect_failures: u32,
    connects: u32,
    resets: u32,
    idle: Duration,
}

/// Serves canned JSON per path. Unknown paths return an empty list.
pub struct MockPlatform {
    org: OrgContext,
    state: Mutex<MockState>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    /// Org 201 "Acme" with actions enabled.
    pub fn new() -> Self {
        Self {
            org: OrgContext {
                org_id: 201,
                org_name: "Acme".to_string(),
                actions_enabled: true,
            },
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_org(mut self, org: OrgContext) -> Self {
        self.org = org;
        self
    }

    pub fn with_response(self, path: &str, body: Value) -> Self {
        self.set_response(path, body);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_response(&self, path: &str, body: Value) {
        self.state().responses.insert(path.to_string(), body);
    }

    /// Fail the next `count` connect attempts.
    pub fn fail_connects(&self, count: u32) {
        self.state().connect_failures = count;
    }

    pub fn set_idle(&self, idle: Duration) {
        self.state().idle = idle;
    }

    pub fn connects(&self) -> u32 {
        self.state().connects
    }

    pub fn resets(&self) -> u32 {
        self.state().resets
    }

    pub fn gets(&self, path: &str) -> usize {
        self.state().gets.iter().filter(|p| *p == path).count()
    }

    pub fn posts(&self) -> Vec<(String, Value)> {
        self.state().posts.clone()
    }
}

#[async_trait]
impl PlatformApi for MockPlatform {
    async fn connect(&self) -> Result<OrgContext> {
        let mut state = self.state();
        state.connects += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(RestError::Status {
                method: "POST".to_string(),
                url: "/rest/session".to_string(),
                status: 503,
                body: "Mock connect failure".to_string(),
            });
        }
        Ok(self.org.clone())
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let mut state = self.state();
        state.gets.push(path.to_string());
        Ok(state
            .responses
            .get(path)
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new())))
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.state().posts.push((path.to_string(), body.clone()));
        Ok(Value::Null)
    }

    fn reset(&self) {
        let mut state = self.state();
        state.resets += 1;
        state.idle = Duration::ZERO;
    }

    fn idle_for(&self) -> Duration {
        self.state().idle
    }
}
