//! Tree-walking evaluator (§4.3). Evaluation is `async` because every
//! variable access goes through the store's lock; recursive calls are
//! boxed by hand since `async fn` cannot recurse directly.

use std::future::Future;
use std::pin::Pin;

use super::ast::{AssignOp, BinOp, Expr, ForLoop, IncDec, Name, NamePart, UnOp};
use super::{EvalSettings, Evaluator, FunctionHandle};
use crate::error::{KnowledgeError, Result};
use crate::record::{Record, RecordValue};
use crate::store::Store;

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub fn eval<'a>(
    expr: &'a Expr,
    store: &'a Store,
    ev: &'a Evaluator,
    settings: &'a EvalSettings,
) -> BoxFut<'a, Result<Record>> {
    Box::pin(async move { eval_inner(expr, store, ev, settings).await })
}

pub(crate) async fn resolve_name(name: &Name, store: &Store, ev: &Evaluator, settings: &EvalSettings) -> Result<String> {
    let mut out = String::new();
    for part in name {
        match part {
            NamePart::Literal(s) => out.push_str(s),
            NamePart::Expand(e) => {
                let r = eval(e, store, ev, settings).await?;
                out.push_str(&r.to_string_delim(","));
            }
        }
    }
    Ok(out)
}

/// Walks a chain of `Index` wrappers down to the underlying variable name,
/// so `arr[i]` assignment knows which store slot to rewrite.
fn base_name(expr: &Expr) -> Option<&Name> {
    match expr {
        Expr::Var(name) => Some(name),
        Expr::Index(base, _) => base_name(base),
        _ => None,
    }
}

fn assign<'a>(
    target: &'a Expr,
    value: Record,
    store: &'a Store,
    ev: &'a Evaluator,
    settings: &'a EvalSettings,
) -> BoxFut<'a, Result<Record>> {
    Box::pin(async move {
        match target {
            Expr::Var(name) => {
                let resolved = resolve_name(name, store, ev, settings).await?;
                if settings.treat_globals_as_locals {
                    store.set_no_publish(&resolved, value.value.clone()).await;
                } else {
                    store.set(&resolved, value.value.clone()).await;
                }
                Ok(value)
            }
            Expr::Index(base, idx_expr) => {
                let Some(name) = base_name(base) else {
                    return Err(KnowledgeError::Type("index assignment target has no backing variable".into()));
                };
                let resolved = resolve_name(name, store, ev, settings).await?;
                let idx = eval(idx_expr, store, ev, settings).await?.to_integer().max(0) as usize;
                let mut current = store.get(&resolved).await;
                current.set_index(idx, &value);
                if settings.treat_globals_as_locals {
                    store.set_no_publish(&resolved, current.value.clone()).await;
                } else {
                    store.set(&resolved, current.value.clone()).await;
                }
                Ok(value)
            }
            _ => Err(KnowledgeError::Type("expression is not assignable".into())),
        }
    })
}

fn numeric_unary_neg(r: &Record) -> Record {
    if matches!(r.value, RecordValue::Integer(_)) {
        Record::from_integer(-r.to_integer())
    } else {
        Record::from_double(-r.to_double())
    }
}

fn step_by_one(cur: &Record, delta: i64) -> Record {
    if matches!(cur.value, RecordValue::Integer(_)) {
        Record::from_integer(cur.to_integer() + delta)
    } else {
        Record::from_double(cur.to_double() + delta as f64)
    }
}

async fn eval_inner(
    expr: &Expr,
    store: &Store,
    ev: &Evaluator,
    settings: &EvalSettings,
) -> Result<Record> {
    match expr {
        Expr::IntLit(n) => Ok(Record::from_integer(*n)),
        Expr::DoubleLit(n) => Ok(Record::from_double(*n)),
        Expr::StringLit(s) => Ok(Record::from_string(s.clone())),

        Expr::ArrayLit(elems) => {
            let mut values = Vec::with_capacity(elems.len());
            for e in elems {
                values.push(eval(e, store, ev, settings).await?);
            }
            let all_integers = values.iter().all(|r| matches!(r.value, RecordValue::Integer(_)));
            if all_integers {
                Ok(Record::from_integer_array(values.iter().map(|r| r.to_integer()).collect()))
            } else {
                Ok(Record::from_double_array(values.iter().map(|r| r.to_double()).collect()))
            }
        }

        Expr::Var(name) => {
            let resolved = resolve_name(name, store, ev, settings).await?;
            Ok(store.get(&resolved).await)
        }

        Expr::Index(base, idx) => {
            let base_val = eval(base, store, ev, settings).await?;
            let i = eval(idx, store, ev, settings).await?.to_integer().max(0) as usize;
            Ok(base_val.retrieve_index(i))
        }

        Expr::Unary(UnOp::Neg, e) => {
            let r = eval(e, store, ev, settings).await?;
            Ok(numeric_unary_neg(&r))
        }
        Expr::Unary(UnOp::Not, e) => {
            let r = eval(e, store, ev, settings).await?;
            Ok(Record::from_integer(if r.is_truthy() { 0 } else { 1 }))
        }

        Expr::PreIncDec(kind, target) => {
            let cur = eval(target, store, ev, settings).await?;
            let delta = match kind {
                IncDec::Inc => 1,
                IncDec::Dec => -1,
            };
            let updated = step_by_one(&cur, delta);
            assign(target, updated.clone(), store, ev, settings).await
        }
        Expr::PostIncDec(kind, target) => {
            let cur = eval(target, store, ev, settings).await?;
            let delta = match kind {
                IncDec::Inc => 1,
                IncDec::Dec => -1,
            };
            let updated = step_by_one(&cur, delta);
            assign(target, updated, store, ev, settings).await?;
            Ok(cur)
        }

        Expr::Binary(BinOp::And, l, r) => {
            let lv = eval(l, store, ev, settings).await?;
            if !lv.is_truthy() {
                return Ok(Record::from_integer(0));
            }
            let rv = eval(r, store, ev, settings).await?;
            Ok(Record::from_integer(if rv.is_truthy() { 1 } else { 0 }))
        }
        Expr::Binary(BinOp::Or, l, r) => {
            let lv = eval(l, store, ev, settings).await?;
            if lv.is_truthy() {
                return Ok(Record::from_integer(1));
            }
            let rv = eval(r, store, ev, settings).await?;
            Ok(Record::from_integer(if rv.is_truthy() { 1 } else { 0 }))
        }
        Expr::Binary(op, l, r) => {
            let lv = eval(l, store, ev, settings).await?;
            let rv = eval(r, store, ev, settings).await?;
            Ok(match op {
                BinOp::Add => lv.add(&rv),
                BinOp::Sub => lv.sub(&rv),
                BinOp::Mul => lv.mul(&rv),
                BinOp::Div => lv.div(&rv),
                BinOp::Rem => lv.rem(&rv),
                BinOp::Eq => Record::from_integer((lv.compare(&rv) == std::cmp::Ordering::Equal) as i64),
                BinOp::Ne => Record::from_integer((lv.compare(&rv) != std::cmp::Ordering::Equal) as i64),
                BinOp::Lt => Record::from_integer((lv.compare(&rv) == std::cmp::Ordering::Less) as i64),
                BinOp::Le => Record::from_integer((lv.compare(&rv) != std::cmp::Ordering::Greater) as i64),
                BinOp::Gt => Record::from_integer((lv.compare(&rv) == std::cmp::Ordering::Greater) as i64),
                BinOp::Ge => Record::from_integer((lv.compare(&rv) != std::cmp::Ordering::Less) as i64),
                BinOp::And | BinOp::Or => unreachable!("short-circuit ops handled above"),
            })
        }

        Expr::Assign(AssignOp::Set, lhs, rhs) => {
            let rv = eval(rhs, store, ev, settings).await?;
            assign(lhs, rv, store, ev, settings).await
        }
        Expr::Assign(op, lhs, rhs) => {
            let rv = eval(rhs, store, ev, settings).await?;
            let cur = eval(lhs, store, ev, settings).await?;
            let updated = match op {
                AssignOp::AddAssign => cur.add(&rv),
                AssignOp::SubAssign => cur.sub(&rv),
                AssignOp::MulAssign => cur.mul(&rv),
                AssignOp::DivAssign => cur.div(&rv),
                AssignOp::RemAssign => cur.rem(&rv),
                AssignOp::Set => unreachable!("handled above"),
            };
            assign(lhs, updated, store, ev, settings).await
        }

        Expr::Seq(l, r) => {
            let lv = eval(l, store, ev, settings).await?;
            eval(r, store, ev, settings).await?;
            Ok(lv)
        }
        Expr::Both(l, r) => {
            eval(l, store, ev, settings).await?;
            eval(r, store, ev, settings).await
        }
        Expr::ReturnRight(l, r) => {
            eval(l, store, ev, settings).await?;
            eval(r, store, ev, settings).await
        }
        Expr::Implies(l, r) => {
            let lv = eval(l, store, ev, settings).await?;
            if lv.is_truthy() {
                eval(r, store, ev, settings).await?;
            }
            Ok(Record::from_integer(if lv.is_truthy() { 1 } else { 0 }))
        }

        Expr::For(ForLoop { var, start, end, step, inclusive, body }) => {
            let var_name = resolve_name(var, store, ev, settings).await?;
            let start_v = eval(start, store, ev, settings).await?.to_integer();
            let end_v = eval(end, store, ev, settings).await?.to_integer();
            let step_raw = eval(step, store, ev, settings).await?.to_integer();
            let step_v = if step_raw == 0 { 1 } else { step_raw };

            let mut i = start_v;
            let mut last = Record::new();
            loop {
                let in_range = if step_v > 0 {
                    if *inclusive { i <= end_v } else { i < end_v }
                } else if *inclusive {
                    i >= end_v
                } else {
                    i > end_v
                };
                if !in_range {
                    break;
                }
                store.set_no_publish(&var_name, RecordValue::Integer(i)).await;
                last = eval(body, store, ev, settings).await?;
                i += step_v;
            }
            Ok(last)
        }

        Expr::Call(name, arg_exprs) => {
            let mut args = Vec::with_capacity(arg_exprs.len());
            for a in arg_exprs {
                args.push(eval(a, store, ev, settings).await?);
            }
            match ev.call_function(name) {
                Some(FunctionHandle::Native(native_name)) => ev
                    .call_native(&native_name, &args)
                    .ok_or_else(|| KnowledgeError::Other(format!("function '{name}' vanished"))),
                Some(FunctionHandle::Karl(body)) => {
                    for (i, a) in args.iter().enumerate() {
                        store.set_no_publish(&format!(".{i}"), a.value.clone()).await;
                    }
                    eval(&body.root, store, ev, settings).await
                }
                None => Err(KnowledgeError::Type(format!("undefined function '{name}'"))),
            }
        }

        Expr::SysCall(name, arg_exprs) => super::syscalls::call(name, arg_exprs, store, ev, settings).await,

        Expr::Size(e) => {
            let r = eval(e, store, ev, settings).await?;
            Ok(Record::from_integer(r.size() as i64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::Evaluator;

    async fn run(src: &str) -> Record {
        let store = Store::new();
        let ev = Evaluator::new();
        ev.evaluate(src, &store, &EvalSettings::default()).await.unwrap()
    }

    #[tokio::test]
    async fn short_circuit_and_skips_rhs_side_effect() {
        let store = Store::new();
        let ev = Evaluator::new();
        ev.evaluate("0 && (x = 1)", &store, &EvalSettings::default()).await.unwrap();
        assert!(!store.exists("x").await);
    }

    #[tokio::test]
    async fn short_circuit_or_skips_rhs_side_effect() {
        let store = Store::new();
        let ev = Evaluator::new();
        ev.evaluate("1 || (x = 1)", &store, &EvalSettings::default()).await.unwrap();
        assert!(!store.exists("x").await);
    }

    #[tokio::test]
    async fn implies_runs_rhs_only_when_truthy() {
        let store = Store::new();
        let ev = Evaluator::new();
        ev.evaluate("1 => (x = 9)", &store, &EvalSettings::default()).await.unwrap();
        assert_eq!(store.get("x").await.to_integer(), 9);
    }

    #[tokio::test]
    async fn for_loop_accumulates() {
        let store = Store::new();
        let ev = Evaluator::new();
        ev.evaluate("total = 0; .i[0->5)total = total + .i", &store, &EvalSettings::default())
            .await
            .unwrap();
        assert_eq!(store.get("total").await.to_integer(), 10);
    }

    #[tokio::test]
    async fn post_increment_returns_old_value() {
        let store = Store::new();
        let ev = Evaluator::new();
        store.set("x", RecordValue::Integer(5)).await;
        let r = ev.evaluate("x++", &store, &EvalSettings::default()).await.unwrap();
        assert_eq!(r.to_integer(), 5);
        assert_eq!(store.get("x").await.to_integer(), 6);
    }

    #[tokio::test]
    async fn golden_expressions() {
        // * / % bind tighter than + -
        assert_eq!(run("1 + 2 * 3").await.to_integer(), 7);
        assert_eq!(run("(1 + 2) * 3").await.to_integer(), 9);
        assert_eq!(run("2 * 3 + 4").await.to_integer(), 10);
        assert_eq!(run("2 + 3 * 4 - 5").await.to_integer(), 9);
        assert_eq!(run("10 / 4").await.to_integer(), 2);
        assert_eq!(run("10.0 / 4").await.to_double(), 2.5);
        assert_eq!(run("10 % 3").await.to_integer(), 1);
        assert_eq!(run("7 % 3 + 1").await.to_integer(), 2);
        assert_eq!(run("2 * 3 % 4").await.to_integer(), 2);
        assert_eq!(run("20 / 4 / 2").await.to_integer(), 2);
        assert_eq!(run("1 / 0").await.to_string_delim(","), "Division by Zero");
        assert_eq!(run("1 % 0").await.to_string_delim(","), "Division by Zero");

        // + - bind tighter than < <= > >=
        assert_eq!(run("1 + 2 < 4").await.to_integer(), 1);
        assert_eq!(run("4 - 1 >= 3").await.to_integer(), 1);
        assert_eq!(run("1 + 1 > 3").await.to_integer(), 0);
        assert_eq!(run("5 - 2 <= 2").await.to_integer(), 0);

        // < <= > >= bind tighter than == !=
        assert_eq!(run("2 * 2 == 4").await.to_integer(), 1);
        assert_eq!(run("2 * 2 != 5").await.to_integer(), 1);
        assert_eq!(run("3 < 4 == 1").await.to_integer(), 1);
        assert_eq!(run("3 > 4 == 0").await.to_integer(), 1);

        // == != bind tighter than &&
        assert_eq!(run("3 < 4 && 4 < 5").await.to_integer(), 1);
        assert_eq!(run("1 == 1 && 2 == 3").await.to_integer(), 0);
        assert_eq!(run("1 + 1 == 2 && 3 > 2").await.to_integer(), 1);

        // && binds tighter than ||
        assert_eq!(run("3 > 4 || 4 <= 5").await.to_integer(), 1);
        assert_eq!(run("1 == 2 || 2 == 2").await.to_integer(), 1);
        assert_eq!(run("0 && 1 || 1").await.to_integer(), 1);
        assert_eq!(run("1 || 0 && 0").await.to_integer(), 1);

        // unary - ! ++ --
        assert_eq!(run("!0").await.to_integer(), 1);
        assert_eq!(run("!1").await.to_integer(), 0);
        assert_eq!(run("!(1 == 1)").await.to_integer(), 0);
        assert_eq!(run("-5 + 3").await.to_integer(), -2);
        assert_eq!(run("-(5 + 3)").await.to_integer(), -8);
        assert_eq!(run("- -5").await.to_integer(), 5);

        // strings
        assert_eq!(run("\"a\" + 1").await.to_string_delim(","), "a1");
        assert_eq!(run("\"a\" + \"b\"").await.to_string_delim(","), "ab");
        assert_eq!(run("\"abc\" == \"abc\"").await.to_integer(), 1);

        // postfix indexing
        assert_eq!(run("[1,2,3][1]").await.to_integer(), 2);
        assert_eq!(run("[1,2,3][0] + [4,5][1]").await.to_integer(), 6);

        // assignment and compound assignment, lowest except implies/seq
        assert_eq!(run("x = 5; x + 1").await.to_integer(), 6);
        assert_eq!(run("x = 5; x += 3").await.to_integer(), 8);
        assert_eq!(run("x = 10; x -= 3").await.to_integer(), 7);
        assert_eq!(run("x = 4; x *= 3").await.to_integer(), 12);
        assert_eq!(run("x = 12; x /= 4").await.to_integer(), 3);
        assert_eq!(run("x = 10; x %= 3").await.to_integer(), 1);
        assert_eq!(run("x = 1; x += 2 * 3").await.to_integer(), 7);
        assert_eq!(run("x = 2; x = x * (x + 1)").await.to_integer(), 6);

        // pre/post increment and decrement
        assert_eq!(run("x = 5; ++x").await.to_integer(), 6);
        assert_eq!(run("x = 5; --x").await.to_integer(), 4);
        assert_eq!(run("x = 5; x++").await.to_integer(), 5);
        assert_eq!(run("x = 5; x--").await.to_integer(), 5);
        assert_eq!(run("x = 5; x++; x").await.to_integer(), 6);

        // sequencing: `,` keeps the left value, `;`/`;>` keep the right
        assert_eq!(run("1, 2").await.to_integer(), 1);
        assert_eq!(run("1 ; 2").await.to_integer(), 2);
        assert_eq!(run("1 ;> 2").await.to_integer(), 2);

        // implies: only evaluates (and only has a side effect on) a truthy lhs
        assert_eq!(run("0 => 99").await.to_integer(), 0);
        assert_eq!(run("1 => 99").await.to_integer(), 1);
        assert_eq!(run("1 => x = 5; x").await.to_integer(), 5);
        assert_eq!(run("0 => x = 5; x").await.to_integer(), 0);
    }
}
