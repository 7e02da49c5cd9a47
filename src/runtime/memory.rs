//! Recording supervisor for tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::ServiceRuntime;
use crate::error::RuntimeError;
use crate::plan::ServicePlan;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AddLayer(String),
    Start(String),
    Stop(String),
    Push(String),
}

#[derive(Debug, Default)]
struct Inner {
    plan: ServicePlan,
    running: BTreeSet<String>,
    calls: Vec<Call>,
    files: BTreeMap<String, String>,
    exit_codes: HashMap<String, i64>,
    start_failures: HashMap<String, RuntimeError>,
}

#[derive(Debug, Default)]
pub struct MemoryRuntime {
    inner: Mutex<Inner>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn count(&self, matcher: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| matcher(c)).count()
    }

    pub fn starts(&self) -> usize {
        self.count(|c| matches!(c, Call::Start(_)))
    }

    pub fn stops(&self) -> usize {
        self.count(|c| matches!(c, Call::Stop(_)))
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.inner.lock().unwrap().files.get(path).cloned()
    }

    /// Makes every start of `service` exit immediately with `code`.
    pub fn exit_on_start(&self, service: &str, code: i64) {
        self.inner
            .lock()
            .unwrap()
            .exit_codes
            .insert(service.to_string(), code);
    }

    /// Makes every start of `service` fail with `err`.
    pub fn fail_start(&self, service: &str, err: RuntimeError) {
        self.inner
            .lock()
            .unwrap()
            .start_failures
            .insert(service.to_string(), err);
    }

    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.start_failures.clear();
        inner.exit_codes.clear();
    }

    /// Simulates the process dying on its own.
    pub fn crash(&self, service: &str) {
        self.inner.lock().unwrap().running.remove(service);
    }
}

#[async_trait]
impl ServiceRuntime for MemoryRuntime {
    async fn plan(&self) -> Result<ServicePlan, RuntimeError> {
        Ok(self.inner.lock().unwrap().plan.clone())
    }

    async fn add_layer(&self, label: &str, layer: &ServicePlan) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::AddLayer(label.to_string()));
        inner.plan.combine(layer);
        Ok(())
    }

    async fn is_running(&self, service: &str) -> Result<bool, RuntimeError> {
        Ok(self.inner.lock().unwrap().running.contains(service))
    }

    async fn start(&self, service: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.plan.service(service).is_none() {
            return Err(RuntimeError::UnknownService(service.to_string()));
        }
        // Every attempt is recorded, including ones that change nothing.
        inner.calls.push(Call::Start(service.to_string()));
        if inner.running.contains(service) {
            return Err(RuntimeError::AlreadyInState);
        }
        if let Some(err) = inner.start_failures.get(service) {
            return Err(err.clone());
        }
        if let Some(code) = inner.exit_codes.get(service) {
            return Err(RuntimeError::ExitedQuickly { code: *code });
        }
        inner.running.insert(service.to_string());
        Ok(())
    }

    async fn stop(&self, service: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Stop(service.to_string()));
        if !inner.running.remove(service) {
            return Err(RuntimeError::AlreadyInState);
        }
        Ok(())
    }

    async fn push(&self, path: &str, contents: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Push(path.to_string()));
        inner.files.insert(path.to_string(), contents.to_string());
        Ok(())
    }
}
