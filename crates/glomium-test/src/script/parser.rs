//! Recursive-descent parser.

use std::sync::Arc;

use super::lexer::{Token, tokenize};
use super::{BinOp, Expr, Lambda, Program};

/// Parse a whole program.
pub(crate) fn parse(source: &str) -> Result<Program, String> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut statements = Vec::new();

    loop {
        while parser.eat(&Token::Semi) {}
        if parser.at_end() {
            break;
        }
        statements.push(parser.expr()?);
        if !parser.at_end() && !parser.eat(&Token::Semi) {
            return Err(format!("expected ';', found {:?}", parser.peek()));
        }
    }
    Ok(Program { statements })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos = self.pos.saturating_add(1);
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos = self.pos.saturating_add(1);
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), String> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(format!("expected {token:?}, found {:?}", self.peek()))
        }
    }

    fn ident(&mut self) -> Result<String, String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(format!("expected identifier, found {other:?}")),
        }
    }

    fn expr(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Throw) {
            return Ok(Expr::Throw(Box::new(self.expr()?)));
        }
        if self.eat(&Token::Loop) {
            return Ok(Expr::Loop(Box::new(self.expr()?)));
        }
        if self.eat(&Token::Fn) {
            return self.lambda();
        }
        self.assignment()
    }

    fn lambda(&mut self) -> Result<Expr, String> {
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                params.push(self.ident()?);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(&Token::Comma)?;
            }
        }
        self.expect(&Token::Arrow)?;
        let body = self.expr()?;
        Ok(Expr::Lambda(Arc::new(Lambda { params, body })))
    }

    fn assignment(&mut self) -> Result<Expr, String> {
        let target = self.equality()?;
        if self.eat(&Token::Assign) {
            let Expr::Ident(name) = target else {
                return Err("invalid assignment target".to_owned());
            };
            return Ok(Expr::Assign(name, Box::new(self.expr()?)));
        }
        Ok(target)
    }

    fn equality(&mut self) -> Result<Expr, String> {
        let mut left = self.additive()?;
        while self.eat(&Token::Eq) {
            let right = self.additive()?;
            left = Expr::Binary(BinOp::Eq, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut left = self.multiplicative()?;
        loop {
            let op = if self.eat(&Token::Plus) {
                BinOp::Add
            } else if self.eat(&Token::Minus) {
                BinOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        while self.eat(&Token::Star) {
            let right = self.unary()?;
            left = Expr::Binary(BinOp::Mul, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                expr = Expr::Member(Box::new(expr), self.ident()?);
            } else if self.eat(&Token::LBracket) {
                let index = self.expr()?;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat(&Token::LParen) {
                let args = self.list(&Token::RParen)?;
                expr = Expr::Call(Box::new(expr), args);
            } else {
                return Ok(expr);
            }
        }
    }

    /// Comma-separated expressions up to `close`; a trailing comma is allowed.
    fn list(&mut self, close: &Token) -> Result<Vec<Expr>, String> {
        let mut items = Vec::new();
        while !self.eat(close) {
            items.push(self.expr()?);
            if !self.eat(&Token::Comma) {
                self.expect(close)?;
                break;
            }
        }
        Ok(items)
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Null) => Ok(Expr::Null),
            Some(Token::Undefined) => Ok(Expr::Undefined),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            },
            Some(Token::LBracket) => Ok(Expr::Array(self.list(&Token::RBracket)?)),
            Some(Token::LBrace) => self.object(),
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    fn object(&mut self) -> Result<Expr, String> {
        let mut entries = Vec::new();
        while !self.eat(&Token::RBrace) {
            let key = match self.next() {
                Some(Token::Ident(key) | Token::Str(key)) => key,
                other => return Err(format!("expected object key, found {other:?}")),
            };
            self.expect(&Token::Colon)?;
            entries.push((key, self.expr()?));
            if !self.eat(&Token::Comma) {
                self.expect(&Token::RBrace)?;
                break;
            }
        }
        Ok(Expr::Object(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence() {
        let program = parse("1 + 2 * 3 == 7").unwrap();
        let Expr::Binary(BinOp::Eq, left, _) = &program.statements[0] else {
            panic!("expected ==");
        };
        assert!(matches!(**left, Expr::Binary(BinOp::Add, _, _)));
    }

    #[test]
    fn statements_and_postfix() {
        let program = parse("x = {a: [1, 2,], 'b c': fn() => 1}; x.a[0]; f(1)(2);").unwrap();
        assert_eq!(program.statements.len(), 3);
        assert!(matches!(program.statements[0], Expr::Assign(..)));
        assert!(matches!(program.statements[1], Expr::Index(..)));
        assert!(matches!(program.statements[2], Expr::Call(..)));
    }

    #[test]
    fn errors() {
        assert!(parse("1 +").is_err());
        assert!(parse("1 2").is_err());
        assert!(parse("(1").is_err());
        assert!(parse("1 = 2").is_err());
        assert!(parse("").unwrap().statements.is_empty());
    }
}
