//! Recursive-descent parser over the lexer's token stream, producing the
//! `Program` AST. Standard precedence climbing for the binary operators:
//! equality < comparison < additive < multiplicative < unary < primary.

use crate::ast::{BinOp, Block, Expr, FunctionDef, Program, Stmt, UnaryOp};
use crate::lexer::Token;

pub fn parse(tokens: &[Token]) -> Result<Program, String> {
    let mut p = Parser { tokens, pos: 0 };
    p.parse_program()
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        if self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(format!("expected {expected:?}, found {:?}", self.peek()))
        }
    }

    fn expect_ident(&mut self) -> Result<String, String> {
        match self.advance() {
            Token::Ident(name) => Ok(name),
            other => Err(format!("expected identifier, found {other:?}")),
        }
    }

    fn parse_program(&mut self) -> Result<Program, String> {
        let mut functions = Vec::new();
        while *self.peek() != Token::Eof {
            self.expect(&Token::Fn)?;
            let name = self.expect_ident()?;
            self.expect(&Token::LParen)?;
            let mut params = Vec::new();
            if *self.peek() != Token::RParen {
                loop {
                    params.push(self.expect_ident()?);
                    if *self.peek() == Token::Comma {
                        self.advance();
                        continue;
                    }
                    break;
                }
            }
            self.expect(&Token::RParen)?;
            let body = self.parse_block()?;
            functions.push((name, FunctionDef { params, body }));
        }
        Ok(Program { functions })
    }

    fn parse_block(&mut self) -> Result<Block, String> {
        self.expect(&Token::LBrace)?;
        let mut stmts = Vec::new();
        let mut tail = None;

        while *self.peek() != Token::RBrace {
            if *self.peek() == Token::Let {
                self.advance();
                let name = self.expect_ident()?;
                self.expect(&Token::Eq)?;
                let value = self.parse_expr()?;
                self.expect(&Token::Semi)?;
                stmts.push(Stmt::Let(name, value));
                continue;
            }

            let expr = self.parse_expr()?;
            if *self.peek() == Token::Semi {
                self.advance();
                stmts.push(Stmt::Expr(expr));
                continue;
            }
            // No trailing semicolon: this expression is the block's value.
            tail = Some(Box::new(expr));
            break;
        }

        self.expect(&Token::RBrace)?;
        Ok(Block { stmts, tail })
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        if *self.peek() == Token::If {
            return self.parse_if();
        }
        self.parse_equality()
    }

    fn parse_if(&mut self) -> Result<Expr, String> {
        self.expect(&Token::If)?;
        let cond = self.parse_expr()?;
        let then_branch = self.parse_block()?;
        let else_branch = if *self.peek() == Token::Else {
            self.advance();
            if *self.peek() == Token::If {
                let inner = self.parse_if()?;
                Some(Block { stmts: vec![], tail: Some(Box::new(inner)) })
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };
        Ok(Expr::If(Box::new(cond), then_branch, else_branch))
    }

    fn parse_equality(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinOp::Eq,
                Token::NotEq => BinOp::Ne,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinOp::Lt,
                Token::Le => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::Ge => BinOp::Ge,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Token::Minus => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            Token::Bang => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Token::Int(v) => Ok(Expr::Int(v)),
            Token::Float(v) => Ok(Expr::Float(v)),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::LParen => {
                let e = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(e)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if *self.peek() != Token::RBracket {
                    loop {
                        items.push(self.parse_expr()?);
                        if *self.peek() == Token::Comma {
                            self.advance();
                            continue;
                        }
                        break;
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(Expr::Array(items))
            }
            Token::LBrace => {
                self.pos -= 1;
                Ok(Expr::Block(self.parse_block()?))
            }
            Token::Ident(name) => {
                if *self.peek() == Token::LParen {
                    self.advance();
                    let mut args = Vec::new();
                    if *self.peek() != Token::RParen {
                        loop {
                            args.push(self.parse_expr()?);
                            if *self.peek() == Token::Comma {
                                self.advance();
                                continue;
                            }
                            break;
                        }
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    fn parse_src(src: &str) -> Program {
        parse(&lex(src).unwrap()).unwrap()
    }

    #[test]
    fn parses_function_returning_string_literal() {
        let prog = parse_src(r#"fn test() { "ok" }"#);
        assert_eq!(prog.functions.len(), 1);
        assert_eq!(prog.functions[0].0, "test");
    }

    #[test]
    fn parses_nested_calls_and_let() {
        let prog = parse_src("fn sum3() { let x = add(add(1, 2), 3); x }");
        assert_eq!(prog.functions[0].1.body.stmts.len(), 1);
        assert!(prog.functions[0].1.body.tail.is_some());
    }

    #[test]
    fn parses_if_else() {
        let prog = parse_src("fn f(x) { if x > 0 { 1 } else { 0 } }");
        assert!(matches!(
            *prog.functions[0].1.body.tail.as_ref().unwrap().as_ref(),
            crate::ast::Expr::If(..)
        ));
    }

    #[test]
    fn rejects_missing_closing_brace() {
        assert!(parse(&lex("fn f() { 1").unwrap()).is_err());
    }
}
