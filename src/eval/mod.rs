//! The embedded expression language ("KaRL"): lexer, parser, compiled
//! expression tree and interpreter, bound together by an `Evaluator` that
//! owns the compile cache and the registered function/`Any`-type tables.

pub mod ast;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod syscalls;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{KnowledgeError, Result};
use crate::record::Record;
use crate::store::Store;

pub use ast::CompiledExpression;

/// A registered callable: either a native Rust function or KaRL source
/// re-evaluated per call with arguments bound to `.0, .1, …` (§4.3).
pub enum Function {
    Native(Box<dyn Fn(&[Record]) -> Record + Send + Sync>),
    Karl(Arc<CompiledExpression>),
}

/// Per-evaluation knobs (§4.3 "settings"): whether assignments inside this
/// evaluation count as local-only ("treat-globals-as-locals"), and the
/// polling parameters `wait` uses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvalSettings {
    pub treat_globals_as_locals: bool,
    pub poll_frequency_hz: f64,
    pub max_wait_secs: f64,
}

impl Default for EvalSettings {
    fn default() -> Self {
        Self { treat_globals_as_locals: false, poll_frequency_hz: 10.0, max_wait_secs: 5.0 }
    }
}

struct CompileCache {
    capacity: usize,
    order: Vec<String>,
    entries: HashMap<String, Arc<CompiledExpression>>,
}

impl CompileCache {
    fn new(capacity: usize) -> Self {
        Self { capacity, order: Vec::new(), entries: HashMap::new() }
    }

    fn get(&self, source: &str) -> Option<Arc<CompiledExpression>> {
        self.entries.get(source).cloned()
    }

    fn insert(&mut self, source: String, expr: Arc<CompiledExpression>) {
        if !self.entries.contains_key(&source) {
            self.order.push(source.clone());
            if self.order.len() > self.capacity {
                let oldest = self.order.remove(0);
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(source, expr);
    }
}

/// Decoder for one registered `Any` tag: turns serialized bytes back into
/// a human-readable string for `#to_string`/`#print` (§3 supplement).
type AnyDecoder = Box<dyn Fn(&[u8]) -> String + Send + Sync>;

/// Owns the compile cache, the function registry, and the `Any`-type
/// decoder registry. Cheap to clone (everything inside is `Arc`/`Mutex`),
/// so a facade can hand evaluators to multiple tasks.
#[derive(Clone)]
pub struct Evaluator {
    cache: Arc<Mutex<CompileCache>>,
    functions: Arc<Mutex<HashMap<String, Function>>>,
    any_decoders: Arc<Mutex<HashMap<u32, AnyDecoder>>>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::with_cache_capacity(256)
    }

    pub fn with_cache_capacity(capacity: usize) -> Self {
        Self {
            cache: Arc::new(Mutex::new(CompileCache::new(capacity))),
            functions: Arc::new(Mutex::new(HashMap::new())),
            any_decoders: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Deterministic, pure: lex, parse, and cache the resulting tree.
    pub fn compile(&self, source: &str) -> Result<Arc<CompiledExpression>> {
        if let Some(cached) = self.cache.lock().unwrap().get(source) {
            return Ok(cached);
        }
        let tokens = lexer::tokenize(source)?;
        let expr = parser::parse(&tokens)?;
        let compiled = Arc::new(CompiledExpression { root: expr, source: source.to_string() });
        self.cache.lock().unwrap().insert(source.to_string(), compiled.clone());
        Ok(compiled)
    }

    pub async fn evaluate(
        &self,
        source: &str,
        store: &Store,
        settings: &EvalSettings,
    ) -> Result<Record> {
        let compiled = self.compile(source)?;
        self.evaluate_compiled(&compiled, store, settings).await
    }

    pub async fn evaluate_compiled(
        &self,
        compiled: &CompiledExpression,
        store: &Store,
        settings: &EvalSettings,
    ) -> Result<Record> {
        interpreter::eval(&compiled.root, store, self, settings).await
    }

    pub fn define_native_function(
        &self,
        name: impl Into<String>,
        f: impl Fn(&[Record]) -> Record + Send + Sync + 'static,
    ) {
        self.functions.lock().unwrap().insert(name.into(), Function::Native(Box::new(f)));
    }

    pub fn define_karl_function(&self, name: impl Into<String>, source: &str) -> Result<()> {
        let compiled = self.compile(source)?;
        self.functions.lock().unwrap().insert(name.into(), Function::Karl(compiled));
        Ok(())
    }

    pub(crate) fn call_function(&self, name: &str) -> Option<FunctionHandle> {
        let functions = self.functions.lock().unwrap();
        match functions.get(name)? {
            Function::Native(_) => Some(FunctionHandle::Native(name.to_string())),
            Function::Karl(body) => Some(FunctionHandle::Karl(body.clone())),
        }
    }

    pub(crate) fn call_native(&self, name: &str, args: &[Record]) -> Option<Record> {
        let functions = self.functions.lock().unwrap();
        match functions.get(name)? {
            Function::Native(f) => Some(f(args)),
            Function::Karl(_) => None,
        }
    }

    /// Register a decoder for `Any`-typed records carrying `tag`, backing
    /// `#to_string`/`#print` over opaque payloads (§3 supplement).
    pub fn register_any_decoder(
        &self,
        tag: u32,
        decode: impl Fn(&[u8]) -> String + Send + Sync + 'static,
    ) {
        self.any_decoders.lock().unwrap().insert(tag, Box::new(decode));
    }

    pub(crate) fn decode_any(&self, tag: u32, bytes: &[u8]) -> Option<String> {
        self.any_decoders.lock().unwrap().get(&tag).map(|d| d(bytes))
    }

    /// `to_string_delim`, but an `Any`-typed record is rendered through its
    /// registered decoder when one exists, falling back to the opaque
    /// `<any:tag>` form otherwise. Backs `#to_string`/`#print`.
    pub(crate) fn render(&self, record: &Record, delim: &str) -> String {
        if let crate::record::RecordValue::Any { tag, bytes } = &record.value {
            if let Some(decoded) = self.decode_any(*tag, bytes) {
                return decoded;
            }
        }
        record.to_string_delim(delim)
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) enum FunctionHandle {
    Native(String),
    Karl(Arc<CompiledExpression>),
}

pub(crate) fn parse_error(msg: impl Into<String>) -> KnowledgeError {
    KnowledgeError::Parse(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordValue;

    #[tokio::test]
    async fn compiles_and_caches() {
        let ev = Evaluator::new();
        let a = ev.compile("1 + 2").unwrap();
        let b = ev.compile("1 + 2").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn evaluate_simple_arithmetic() {
        let store = Store::new();
        let ev = Evaluator::new();
        let r = ev.evaluate("2 + 3 * 4", &store, &EvalSettings::default()).await.unwrap();
        assert_eq!(r.to_integer(), 14);
    }

    #[tokio::test]
    async fn assignment_writes_through_to_store() {
        let store = Store::new();
        let ev = Evaluator::new();
        ev.evaluate("x = 5", &store, &EvalSettings::default()).await.unwrap();
        assert_eq!(store.get("x").await.to_integer(), 5);
    }

    #[tokio::test]
    async fn native_function_call() {
        let store = Store::new();
        let ev = Evaluator::new();
        ev.define_native_function("double_it", |args: &[Record]| {
            Record::from_integer(args.first().map(|r| r.to_integer()).unwrap_or(0) * 2)
        });
        store.set("x", RecordValue::Integer(21)).await;
        let r = ev.evaluate("double_it(x)", &store, &EvalSettings::default()).await.unwrap();
        assert_eq!(r.to_integer(), 42);
    }
}
