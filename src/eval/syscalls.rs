//! The fixed `#`-prefixed system-call catalogue (§4.3/§6.3, expanded per
//! the supplement grounded in the original interpreter's system-calls
//! table). Arity is fixed per call; a wrong count is a type error rather
//! than a silent no-op so mistakes surface immediately.

use rand::Rng;

use super::ast::Expr;
use super::interpreter::{eval, resolve_name};
use super::{EvalSettings, Evaluator};
use crate::error::{KnowledgeError, Result};
use crate::record::Record;
use crate::store::Store;

fn arity_error(name: &str, expected: &str, got: usize) -> KnowledgeError {
    KnowledgeError::Type(format!("#{name} expects {expected} argument(s), got {got}"))
}

/// Resolves `expr` as a store slot name when it's a bare variable
/// reference; used by syscalls that operate on the named slot itself
/// (`#get_clock`, `#set_clock`, `#exists`, `#delete_var`) rather than on
/// an evaluated value.
async fn expr_as_name(expr: &Expr, store: &Store, ev: &Evaluator, settings: &EvalSettings) -> Result<String> {
    match expr {
        Expr::Var(name) => resolve_name(name, store, ev, settings).await,
        other => Ok(ev.render(&eval(other, store, ev, settings).await?, ",")),
    }
}

/// Expands `{name}` occurrences in `template` against the store — the
/// print-template semantics of §4.2, distinct from the KaRL `{}` operator
/// which expands at parse/identifier level.
async fn expand_template(template: &str, store: &Store, ev: &Evaluator) -> String {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            let mut name = String::new();
            let mut closed = false;
            for c2 in chars.by_ref() {
                if c2 == '}' {
                    closed = true;
                    break;
                }
                name.push(c2);
            }
            if closed {
                out.push_str(&ev.render(&store.get(&name).await, ","));
            } else {
                out.push('{');
                out.push_str(&name);
            }
        } else {
            out.push(c);
        }
    }
    out
}

pub async fn call(
    name: &str,
    args: &[Expr],
    store: &Store,
    ev: &Evaluator,
    settings: &EvalSettings,
) -> Result<Record> {
    match name {
        "print" => {
            if args.len() != 1 {
                return Err(arity_error(name, "1", args.len()));
            }
            let template = ev.render(&eval(&args[0], store, ev, settings).await?, ",");
            let expanded = expand_template(&template, store, ev).await;
            log::info!("{expanded}");
            Ok(Record::from_string(expanded))
        }

        "size" => {
            if args.len() != 1 {
                return Err(arity_error(name, "1", args.len()));
            }
            let v = eval(&args[0], store, ev, settings).await?;
            Ok(Record::from_integer(v.size() as i64))
        }

        "get_clock" => {
            if args.is_empty() {
                Ok(Record::from_integer(store.current_clock().await as i64))
            } else if args.len() == 1 {
                let n = expr_as_name(&args[0], store, ev, settings).await?;
                Ok(Record::from_integer(store.get(&n).await.clock as i64))
            } else {
                Err(arity_error(name, "0 or 1", args.len()))
            }
        }

        "set_clock" => {
            if args.len() != 2 {
                return Err(arity_error(name, "2", args.len()));
            }
            let n = expr_as_name(&args[0], store, ev, settings).await?;
            let clock = eval(&args[1], store, ev, settings).await?.to_integer().max(0) as u64;
            let mut rec = store.get(&n).await;
            rec.clock = clock;
            store.apply(&n, &rec).await;
            Ok(Record::from_integer(clock as i64))
        }

        "log_level" => {
            if args.is_empty() {
                Ok(Record::from_integer(log::max_level() as i64))
            } else if args.len() == 1 {
                let level = eval(&args[0], store, ev, settings).await?.to_integer();
                let filter = match level {
                    n if n <= 0 => log::LevelFilter::Error,
                    1 => log::LevelFilter::Warn,
                    2 => log::LevelFilter::Info,
                    3 => log::LevelFilter::Debug,
                    _ => log::LevelFilter::Trace,
                };
                log::set_max_level(filter);
                Ok(Record::from_integer(level))
            } else {
                Err(arity_error(name, "0 or 1", args.len()))
            }
        }

        "sleep" => {
            if args.len() != 1 {
                return Err(arity_error(name, "1", args.len()));
            }
            let secs = eval(&args[0], store, ev, settings).await?.to_double();
            tokio::time::sleep(std::time::Duration::from_secs_f64(secs.max(0.0))).await;
            Ok(Record::new())
        }

        "to_integer" => {
            if args.len() != 1 {
                return Err(arity_error(name, "1", args.len()));
            }
            Ok(Record::from_integer(eval(&args[0], store, ev, settings).await?.to_integer()))
        }

        "to_double" => {
            if args.len() != 1 {
                return Err(arity_error(name, "1", args.len()));
            }
            Ok(Record::from_double(eval(&args[0], store, ev, settings).await?.to_double()))
        }

        "to_string" => {
            if args.is_empty() || args.len() > 2 {
                return Err(arity_error(name, "1 or 2", args.len()));
            }
            let v = eval(&args[0], store, ev, settings).await?;
            let delim = if args.len() == 2 {
                eval(&args[1], store, ev, settings).await?.to_string_delim(",")
            } else {
                ",".to_string()
            };
            Ok(Record::from_string(ev.render(&v, &delim)))
        }

        "exists" => {
            if args.len() != 1 {
                return Err(arity_error(name, "1", args.len()));
            }
            let n = expr_as_name(&args[0], store, ev, settings).await?;
            Ok(Record::from_integer(store.exists(&n).await as i64))
        }

        "delete_var" => {
            if args.len() != 1 {
                return Err(arity_error(name, "1", args.len()));
            }
            let n = expr_as_name(&args[0], store, ev, settings).await?;
            Ok(Record::from_integer(store.delete(&n).await as i64))
        }

        "fragment" => {
            if args.len() != 3 {
                return Err(arity_error(name, "3", args.len()));
            }
            let v = eval(&args[0], store, ev, settings).await?;
            let first = eval(&args[1], store, ev, settings).await?.to_integer().max(0) as usize;
            let last = eval(&args[2], store, ev, settings).await?.to_integer().max(0) as usize;
            Ok(v.fragment(first, last))
        }

        "random_int" => {
            if args.is_empty() {
                Ok(Record::from_integer(rand::thread_rng().gen::<i64>()))
            } else if args.len() == 2 {
                let min = eval(&args[0], store, ev, settings).await?.to_integer();
                let max = eval(&args[1], store, ev, settings).await?.to_integer();
                let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
                Ok(Record::from_integer(rand::thread_rng().gen_range(lo..=hi)))
            } else {
                Err(arity_error(name, "0 or 2", args.len()))
            }
        }

        "random_double" => {
            if !args.is_empty() {
                return Err(arity_error(name, "0", args.len()));
            }
            Ok(Record::from_double(rand::thread_rng().gen::<f64>()))
        }

        other => Err(KnowledgeError::Parse(format!("unknown system call '#{other}'"))),
    }
}
