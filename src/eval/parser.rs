//! Recursive-descent parser with explicit precedence tiers matching the
//! fixed operator table (§4.3, low → high):
//! `, ; ;>`, `=>`, `= += -= *= /= %=`, `||`, `&&`, `== !=`, `< <= > >=`,
//! `+ -`, `* / %`, unary `- ! ++ --`, postfix `++ -- () [] {}`.
//!
//! The for-loop's bound syntax (`.i[a->b]body`, optionally `[a->b:k]body`
//! for a negative/explicit step, `)` instead of `]` for an exclusive upper
//! bound) is this crate's concrete rendering of the abstract `[a → b)` /
//! `[a -k-> b]` forms in the source design — the grammar leaves the exact
//! ASCII token open, so this is a deliberate choice, recorded in the
//! project's design notes.

use super::ast::{literal_name, static_name, AssignOp, BinOp, Expr, ForLoop, IncDec, Name, UnOp};
use super::lexer::Token;
use super::parse_error;
use crate::error::Result;

pub fn parse(tokens: &[Token]) -> Result<Expr> {
    let mut parser = Parser { tokens, pos: 0 };
    if tokens.is_empty() {
        return Err(parse_error("empty expression"));
    }
    let expr = parser.parse_seq()?;
    if parser.pos != parser.tokens.len() {
        return Err(parse_error(format!(
            "unexpected trailing token at position {}",
            parser.pos
        )));
    }
    Ok(expr)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.bump() {
            Some(t) if t == expected => Ok(()),
            Some(other) => Err(parse_error(format!("expected {expected:?}, found {other:?}"))),
            None => Err(parse_error(format!("expected {expected:?}, found end of input"))),
        }
    }

    fn parse_seq(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_implies()?;
        loop {
            match self.peek() {
                Some(Token::Comma) => {
                    self.bump();
                    let rhs = self.parse_implies()?;
                    lhs = Expr::Seq(Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Semicolon) => {
                    self.bump();
                    let rhs = self.parse_implies()?;
                    lhs = Expr::Both(Box::new(lhs), Box::new(rhs));
                }
                Some(Token::SemiGt) => {
                    self.bump();
                    let rhs = self.parse_implies()?;
                    lhs = Expr::ReturnRight(Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_implies(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_assign()?;
        while matches!(self.peek(), Some(Token::FatArrow)) {
            self.bump();
            let rhs = self.parse_assign()?;
            lhs = Expr::Implies(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_assign(&mut self) -> Result<Expr> {
        let lhs = self.parse_or()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(AssignOp::Set),
            Some(Token::PlusEq) => Some(AssignOp::AddAssign),
            Some(Token::MinusEq) => Some(AssignOp::SubAssign),
            Some(Token::StarEq) => Some(AssignOp::MulAssign),
            Some(Token::SlashEq) => Some(AssignOp::DivAssign),
            Some(Token::PercentEq) => Some(AssignOp::RemAssign),
            _ => None,
        };
        let Some(op) = op else { return Ok(lhs) };
        if !is_lvalue(&lhs) {
            return Err(parse_error("left-hand side of assignment is not assignable"));
        }
        self.bump();
        let rhs = self.parse_assign()?;
        Ok(Expr::Assign(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::OrOr)) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_eq()?;
        while matches!(self.peek(), Some(Token::AndAnd)) {
            self.bump();
            let rhs = self.parse_eq()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_eq(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_rel()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_rel()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_rel(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_add()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_add()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_mul()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.bump();
                Ok(Expr::Unary(UnOp::Neg, Box::new(self.parse_unary()?)))
            }
            Some(Token::Bang) => {
                self.bump();
                Ok(Expr::Unary(UnOp::Not, Box::new(self.parse_unary()?)))
            }
            Some(Token::PlusPlus) => {
                self.bump();
                let inner = self.parse_unary()?;
                if !is_lvalue(&inner) {
                    return Err(parse_error("'++' target is not assignable"));
                }
                Ok(Expr::PreIncDec(IncDec::Inc, Box::new(inner)))
            }
            Some(Token::MinusMinus) => {
                self.bump();
                let inner = self.parse_unary()?;
                if !is_lvalue(&inner) {
                    return Err(parse_error("'--' target is not assignable"));
                }
                Ok(Expr::PreIncDec(IncDec::Dec, Box::new(inner)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::PlusPlus) if is_lvalue(&expr) => {
                    self.bump();
                    expr = Expr::PostIncDec(IncDec::Inc, Box::new(expr));
                }
                Some(Token::MinusMinus) if is_lvalue(&expr) => {
                    self.bump();
                    expr = Expr::PostIncDec(IncDec::Dec, Box::new(expr));
                }
                Some(Token::LBracket) => {
                    if let Expr::Var(name) = &expr {
                        if is_local_name(name) {
                            if let Some(for_loop) = self.try_parse_for_loop(name.clone())? {
                                expr = for_loop;
                                continue;
                            }
                        }
                    }
                    self.bump();
                    let index = self.parse_seq()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Token::LParen) => {
                    let name = match &expr {
                        Expr::Var(name) => static_name(name)
                            .ok_or_else(|| parse_error("function name must not contain '{...}'"))?
                            .to_string(),
                        _ => break,
                    };
                    self.bump();
                    let args = self.parse_arg_list()?;
                    self.expect(&Token::RParen)?;
                    expr = Expr::Call(name, args);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_arg_list(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_assign()?);
            if matches!(self.peek(), Some(Token::Comma)) {
                self.bump();
            } else {
                break;
            }
        }
        Ok(args)
    }

    /// Attempts `[start->end]`/`[start->end)` with an optional `:step`,
    /// having already consumed the loop variable. Backtracks and returns
    /// `Ok(None)` if the bracket turns out to be a plain index instead.
    fn try_parse_for_loop(&mut self, var: Name) -> Result<Option<Expr>> {
        let start_pos = self.pos;
        self.bump(); // '['
        let start = match self.parse_add() {
            Ok(e) => e,
            Err(_) => {
                self.pos = start_pos;
                return Ok(None);
            }
        };
        if !matches!(self.peek(), Some(Token::Arrow)) {
            self.pos = start_pos;
            return Ok(None);
        }
        self.bump(); // '->'
        let end = self.parse_add()?;
        let step = if matches!(self.peek(), Some(Token::Colon)) {
            self.bump();
            self.parse_add()?
        } else {
            Expr::IntLit(1)
        };
        let inclusive = match self.bump() {
            Some(Token::RBracket) => true,
            Some(Token::RParen) => false,
            other => return Err(parse_error(format!("expected ']' or ')' to close for-loop range, found {other:?}"))),
        };
        // Assignment precedence so an accumulating body like
        // `total = total + .i` parses as the loop's whole body instead of
        // leaving `= total + .i` dangling to be (invalidly) applied to the
        // for-loop expression itself one level up.
        let body = self.parse_assign()?;
        Ok(Some(Expr::For(ForLoop {
            var,
            start: Box::new(start),
            end: Box::new(end),
            step: Box::new(step),
            inclusive,
            body: Box::new(body),
        })))
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.bump().cloned() {
            Some(Token::Int(n)) => Ok(Expr::IntLit(n)),
            Some(Token::Double(n)) => Ok(Expr::DoubleLit(n)),
            Some(Token::Str(s)) => Ok(Expr::StringLit(s)),
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::Sys(name)) => {
                self.expect(&Token::LParen)?;
                let args = self.parse_arg_list()?;
                self.expect(&Token::RParen)?;
                Ok(Expr::SysCall(name, args))
            }
            Some(Token::LParen) => {
                let inner = self.parse_seq()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut elems = Vec::new();
                if !matches!(self.peek(), Some(Token::RBracket)) {
                    loop {
                        elems.push(self.parse_assign()?);
                        if matches!(self.peek(), Some(Token::Comma)) {
                            self.bump();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(Expr::ArrayLit(elems))
            }
            other => Err(parse_error(format!("unexpected token {other:?} in expression"))),
        }
    }
}

fn is_local_name(name: &Name) -> bool {
    static_name(name).map(|s| s.starts_with('.')).unwrap_or(false)
}

fn is_lvalue(expr: &Expr) -> bool {
    matches!(expr, Expr::Var(_) | Expr::Index(..))
}

#[allow(dead_code)]
fn var(name: &str) -> Expr {
    Expr::Var(literal_name(name))
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    fn parse_src(src: &str) -> Expr {
        parse(&tokenize(src).unwrap()).unwrap()
    }

    #[test]
    fn precedence_mul_over_add() {
        match parse_src("1 + 2 * 3") {
            Expr::Binary(BinOp::Add, lhs, rhs) => {
                assert!(matches!(*lhs, Expr::IntLit(1)));
                assert!(matches!(*rhs, Expr::Binary(BinOp::Mul, _, _)));
            }
            other => panic!("unexpected tree {other:?}"),
        }
    }

    #[test]
    fn assignment_is_right_associative() {
        match parse_src("a = b = 1") {
            Expr::Assign(AssignOp::Set, _, rhs) => {
                assert!(matches!(*rhs, Expr::Assign(AssignOp::Set, _, _)));
            }
            other => panic!("unexpected tree {other:?}"),
        }
    }

    #[test]
    fn rejects_assignment_to_literal() {
        assert!(parse(&tokenize("1 = 2").unwrap()).is_err());
    }

    #[test]
    fn for_loop_parses_range_and_body() {
        match parse_src(".i[0->10)x = .i") {
            Expr::For(ForLoop { inclusive, .. }) => assert!(!inclusive),
            other => panic!("unexpected tree {other:?}"),
        }
    }

    #[test]
    fn plain_index_is_not_mistaken_for_for_loop() {
        match parse_src("arr[3]") {
            Expr::Index(_, _) => {}
            other => panic!("unexpected tree {other:?}"),
        }
    }

    #[test]
    fn function_call_parses_arguments() {
        match parse_src("max(1, 2)") {
            Expr::Call(name, args) => {
                assert_eq!(name, "max");
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected tree {other:?}"),
        }
    }
}
