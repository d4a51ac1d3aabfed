//! The public coordinator (§4.7): a thin object binding a [`Store`], an
//! [`Evaluator`], and an optional [`Transport`]. Every method here is a
//! documented composition of those three, not new logic of its own.

use std::path::Path;
use std::sync::Arc;

use tokio::time::{sleep, timeout, Duration};

use crate::error::Result;
use crate::eval::{CompiledExpression, EvalSettings, Evaluator};
use crate::record::{Record, RecordValue};
use crate::store::{Store, VariableReference};
use crate::transport::{Transport, TransportFilters};

pub struct KnowledgeBase {
    store: Arc<Store>,
    evaluator: Evaluator,
    eval_settings: EvalSettings,
    transport: Option<Arc<Transport>>,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self { store: Arc::new(Store::new()), evaluator: Evaluator::new(), eval_settings: EvalSettings::default(), transport: None }
    }

    pub fn with_eval_settings(mut self, settings: EvalSettings) -> Self {
        self.eval_settings = settings;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn eval_settings(&self) -> &EvalSettings {
        &self.eval_settings
    }

    pub async fn set(&self, name: &str, value: RecordValue) {
        self.store.set(name, value).await;
    }

    pub async fn get(&self, name: &str) -> Record {
        self.store.get(name).await
    }

    pub async fn get_ref(&self, name: &str) -> VariableReference {
        self.store.get_ref(name).await
    }

    pub fn compile(&self, source: &str) -> Result<Arc<CompiledExpression>> {
        self.evaluator.compile(source)
    }

    pub async fn evaluate(&self, source: &str) -> Result<Record> {
        self.evaluator.evaluate(source, &self.store, &self.eval_settings).await
    }

    pub fn define_function(&self, name: impl Into<String>, karl_source: &str) -> Result<()> {
        self.evaluator.define_karl_function(name, karl_source)
    }

    pub fn define_native_function(&self, name: impl Into<String>, f: impl Fn(&[Record]) -> Record + Send + Sync + 'static) {
        self.evaluator.define_native_function(name, f)
    }

    /// Compiles `expr` if necessary, evaluates once, and if not yet
    /// truthy re-evaluates on every store change signal until truthy or
    /// `max_wait_secs` elapses (§4.7). Returns the last evaluated record
    /// either way — callers check truthiness themselves, mirroring the
    /// "returns false at timeout without throwing" contract.
    pub async fn wait(&self, expr: &str) -> Result<Record> {
        let compiled = self.evaluator.compile(expr)?;
        let first = self.evaluator.evaluate_compiled(&compiled, &self.store, &self.eval_settings).await?;
        if first.is_truthy() {
            return Ok(first);
        }

        let deadline = Duration::from_secs_f64(self.eval_settings.max_wait_secs.max(0.0));
        let poll_interval = Duration::from_secs_f64(1.0 / self.eval_settings.poll_frequency_hz.max(0.001));
        let mut last = first;

        let result = timeout(deadline, async {
            loop {
                tokio::select! {
                    _ = self.store.wait_for_change() => {}
                    _ = sleep(poll_interval) => {}
                }
                last = self.evaluator.evaluate_compiled(&compiled, &self.store, &self.eval_settings).await?;
                if last.is_truthy() {
                    return Ok::<(), crate::error::KnowledgeError>(());
                }
            }
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(last),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(last),
        }
    }

    pub async fn read_file(&self, name: &str, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path).await?;
        let value = match path.extension().and_then(|e| e.to_str()) {
            Some("jpg") | Some("jpeg") => RecordValue::ImageJpeg(Arc::new(bytes)),
            Some("txt") => RecordValue::TextFile(Arc::new(String::from_utf8_lossy(&bytes).into_owned())),
            Some("xml") => RecordValue::Xml(Arc::new(String::from_utf8_lossy(&bytes).into_owned())),
            _ => RecordValue::BinaryFile(Arc::new(bytes)),
        };
        self.store.set(name, value).await;
        Ok(())
    }

    pub async fn write_file(&self, name: &str, path: &Path) -> Result<()> {
        let record = self.store.get(name).await;
        let bytes: Vec<u8> = match &record.value {
            RecordValue::BinaryFile(b) | RecordValue::ImageJpeg(b) => (**b).clone(),
            _ => record.to_string_delim(",").into_bytes(),
        };
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    pub async fn save_context(&self) -> Vec<u8> {
        self.store.save_context().await
    }

    pub async fn load_context(&self, buf: &[u8]) -> Result<usize> {
        self.store.load_context(buf).await
    }

    /// Sweeps the store's modified set and sends it over the attached
    /// transport (§4.1/§4.6). A no-op if no transport is attached.
    pub async fn send_modifieds(&self) -> Result<()> {
        let Some(transport) = &self.transport else { return Ok(()) };
        let names = self.store.drain_modified().await;
        if names.is_empty() {
            return Ok(());
        }
        let mut records = std::collections::HashMap::with_capacity(names.len());
        for name in names {
            records.insert(name.clone(), self.store.get(&name).await);
        }
        transport.send_modifieds(records).await
    }

    /// Attaches a transport, spawning its receive loop as a background
    /// task bound to this knowledge base's store.
    pub async fn attach_transport(
        &mut self,
        settings: crate::transport::settings::TransportSettings,
        filters: TransportFilters,
    ) -> Result<()> {
        let transport = Arc::new(Transport::new(settings, self.store.clone(), filters).await?);
        tokio::spawn(transport.clone().run_receive_loop());
        self.transport = Some(transport);
        Ok(())
    }

    pub fn transport_settings(&self) -> Option<&crate::transport::settings::TransportSettings> {
        self.transport.as_ref().map(|t| t.settings())
    }
}

impl Default for KnowledgeBase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_round_trips_through_facade() {
        let kb = KnowledgeBase::new();
        kb.set("x", RecordValue::Integer(9)).await;
        assert_eq!(kb.get("x").await.to_integer(), 9);
    }

    #[tokio::test]
    async fn evaluate_and_compile_share_the_cache() {
        let kb = KnowledgeBase::new();
        let compiled = kb.compile("x = 3").unwrap();
        let r = kb.evaluate("x = 3").await.unwrap();
        assert_eq!(r.to_integer(), 3);
        assert_eq!(compiled.source, "x = 3");
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_truthy() {
        let kb = KnowledgeBase::new();
        kb.set("ready", RecordValue::Integer(1)).await;
        let r = kb.wait("ready").await.unwrap();
        assert!(r.is_truthy());
    }

    #[tokio::test]
    async fn wait_wakes_on_store_change_and_returns_truthy() {
        let kb = Arc::new(KnowledgeBase::new());
        let writer = kb.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            writer.set("flag", RecordValue::Integer(1)).await;
        });
        let r = kb.wait("flag").await.unwrap();
        assert!(r.is_truthy());
    }

    #[tokio::test]
    async fn wait_times_out_without_error() {
        let kb = KnowledgeBase::new().with_eval_settings(EvalSettings { max_wait_secs: 0.05, poll_frequency_hz: 50.0, ..EvalSettings::default() });
        let r = kb.wait("never_set").await.unwrap();
        assert!(!r.is_truthy());
    }

    #[tokio::test]
    async fn save_and_load_context_round_trip_through_facade() {
        let kb = KnowledgeBase::new();
        kb.set("a", RecordValue::Integer(5)).await;
        let buf = kb.save_context().await;

        let reloaded = KnowledgeBase::new();
        reloaded.load_context(&buf).await.unwrap();
        assert_eq!(reloaded.get("a").await.to_integer(), 5);
    }
}
