use crate::compiler::ast::*;
use crate::compiler::lexer::{Span, Token, TokenKind};

/// A recursive descent parser for the source language.
pub struct Parser<'a> {
    filename: &'a str,
    tokens: Vec<Token>,
    current: usize,
}

impl<'a> Parser<'a> {
    pub fn new(filename: &'a str, tokens: Vec<Token>) -> Self {
        Self {
            filename,
            tokens,
            current: 0,
        }
    }

    /// Parse a whole program: function declarations and top-level
    /// statements, in source order.
    pub fn parse(&mut self) -> Result<Expr, String> {
        let mut items = Vec::new();

        while !self.is_at_end() {
            if self.check(&TokenKind::Function) {
                items.push(self.function_decl()?);
            } else {
                items.push(self.statement()?);
            }
        }

        Ok(Expr::TopStatements(items))
    }

    fn function_decl(&mut self) -> Result<Expr, String> {
        self.expect(&TokenKind::Function)?;
        let name = self.expect_ident()?;
        self.expect(&TokenKind::LParen)?;

        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            params.push(self.expect_ident()?);
            while self.match_token(&TokenKind::Comma) {
                params.push(self.expect_ident()?);
            }
        }
        self.expect(&TokenKind::RParen)?;

        let body = self.block()?;

        Ok(Expr::Function {
            name,
            params,
            body: Box::new(body),
        })
    }

    fn block(&mut self) -> Result<Expr, String> {
        self.expect(&TokenKind::LBrace)?;

        let mut statements = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.is_at_end() {
            statements.push(self.statement()?);
        }

        self.expect(&TokenKind::RBrace)?;

        Ok(Expr::Block(statements))
    }

    fn statement(&mut self) -> Result<Expr, String> {
        if self.check(&TokenKind::Var) {
            self.var_stmt()
        } else if self.check(&TokenKind::If) {
            self.if_stmt()
        } else if self.check(&TokenKind::While) {
            self.while_stmt()
        } else if self.check(&TokenKind::For) {
            self.for_stmt()
        } else if self.match_token(&TokenKind::Break) {
            self.expect(&TokenKind::Semi)?;
            Ok(Expr::Break)
        } else if self.match_token(&TokenKind::Continue) {
            self.expect(&TokenKind::Semi)?;
            Ok(Expr::Continue)
        } else if self.check(&TokenKind::Return) {
            self.return_stmt()
        } else if self.check(&TokenKind::LBrace) {
            self.block()
        } else {
            let expr = self.expression()?;
            self.expect(&TokenKind::Semi)?;
            Ok(expr)
        }
    }

    fn var_stmt(&mut self) -> Result<Expr, String> {
        self.expect(&TokenKind::Var)?;
        let name = self.expect_ident()?;
        self.expect(&TokenKind::Eq)?;
        let init = self.expression()?;
        self.expect(&TokenKind::Semi)?;

        Ok(Expr::VarDef {
            name,
            init: Box::new(init),
        })
    }

    fn if_stmt(&mut self) -> Result<Expr, String> {
        self.expect(&TokenKind::If)?;
        self.expect(&TokenKind::LParen)?;
        let condition = self.expression()?;
        self.expect(&TokenKind::RParen)?;

        let then_branch = self.statement()?;
        let else_branch = if self.match_token(&TokenKind::Else) {
            Some(Box::new(self.statement()?))
        } else {
            None
        };

        Ok(Expr::If {
            condition: Box::new(condition),
            then_branch: Box::new(then_branch),
            else_branch,
        })
    }

    fn while_stmt(&mut self) -> Result<Expr, String> {
        self.expect(&TokenKind::While)?;
        self.expect(&TokenKind::LParen)?;
        let condition = self.expression()?;
        self.expect(&TokenKind::RParen)?;
        let body = self.statement()?;

        Ok(Expr::While {
            condition: Box::new(condition),
            body: Box::new(body),
        })
    }

    fn for_stmt(&mut self) -> Result<Expr, String> {
        self.expect(&TokenKind::For)?;
        self.expect(&TokenKind::LParen)?;

        // Initializer: a var statement, an expression statement, or empty.
        // The var/expression paths consume their own ';'.
        let init = if self.check(&TokenKind::Var) {
            self.var_stmt()?
        } else if self.match_token(&TokenKind::Semi) {
            Expr::Undefined
        } else {
            let expr = self.expression()?;
            self.expect(&TokenKind::Semi)?;
            expr
        };

        // Condition: empty means "loop forever".
        let condition = if self.check(&TokenKind::Semi) {
            Expr::Bool(true)
        } else {
            self.expression()?
        };
        self.expect(&TokenKind::Semi)?;

        let iteration = if self.check(&TokenKind::RParen) {
            Expr::Undefined
        } else {
            self.expression()?
        };
        self.expect(&TokenKind::RParen)?;

        let body = self.statement()?;

        Ok(Expr::For {
            init: Box::new(init),
            condition: Box::new(condition),
            iteration: Box::new(iteration),
            body: Box::new(body),
        })
    }

    fn return_stmt(&mut self) -> Result<Expr, String> {
        self.expect(&TokenKind::Return)?;

        let value = if self.check(&TokenKind::Semi) {
            Expr::Undefined
        } else {
            self.expression()?
        };
        self.expect(&TokenKind::Semi)?;

        Ok(Expr::Unary {
            op: UnaryOp::Return,
            operand: Box::new(value),
        })
    }

    // Expression parsing with precedence climbing

    fn expression(&mut self) -> Result<Expr, String> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr, String> {
        let left = self.pipe_expr()?;

        if self.match_token(&TokenKind::Eq) {
            if !matches!(left, Expr::Ident(_)) {
                return Err(self.error("invalid assignment target"));
            }
            let right = self.assignment()?;
            return Ok(Expr::Binary {
                op: BinaryOp::Assign,
                left: Box::new(left),
                right: Box::new(right),
            });
        }

        Ok(left)
    }

    fn pipe_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.or_expr()?;

        while self.match_token(&TokenKind::Pipe) {
            let right = self.or_expr()?;
            left = Expr::Binary {
                op: BinaryOp::Pipe,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn or_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.and_expr()?;

        while self.match_token(&TokenKind::OrOr) {
            let right = self.and_expr()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.eq_expr()?;

        while self.match_token(&TokenKind::AndAnd) {
            let right = self.eq_expr()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn eq_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.cmp_expr()?;

        loop {
            let op = if self.match_token(&TokenKind::EqEq) {
                BinaryOp::Eq
            } else if self.match_token(&TokenKind::EqEqEq) {
                BinaryOp::StrictEq
            } else if self.match_token(&TokenKind::NotEq) {
                BinaryOp::Ne
            } else if self.match_token(&TokenKind::NotEqEq) {
                BinaryOp::StrictNe
            } else {
                break;
            };

            let right = self.cmp_expr()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn cmp_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.add_expr()?;

        loop {
            let op = if self.match_token(&TokenKind::Lt) {
                BinaryOp::Lt
            } else if self.match_token(&TokenKind::Le) {
                BinaryOp::Le
            } else if self.match_token(&TokenKind::Gt) {
                BinaryOp::Gt
            } else if self.match_token(&TokenKind::Ge) {
                BinaryOp::Ge
            } else {
                break;
            };

            let right = self.add_expr()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn add_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.mul_expr()?;

        loop {
            let op = if self.match_token(&TokenKind::Plus) {
                BinaryOp::Add
            } else if self.match_token(&TokenKind::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };

            let right = self.mul_expr()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn mul_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.unary_expr()?;

        loop {
            let op = if self.match_token(&TokenKind::Star) {
                BinaryOp::Mul
            } else if self.match_token(&TokenKind::Slash) {
                BinaryOp::Div
            } else {
                break;
            };

            let right = self.unary_expr()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn unary_expr(&mut self) -> Result<Expr, String> {
        if self.match_token(&TokenKind::Minus) {
            let operand = self.unary_expr()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }

        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, String> {
        if let Some(TokenKind::Number(value)) = self.peek_kind() {
            let value = *value;
            self.advance();
            return Ok(Expr::Number(value));
        }

        if self.match_token(&TokenKind::True) {
            return Ok(Expr::Bool(true));
        }

        if self.match_token(&TokenKind::False) {
            return Ok(Expr::Bool(false));
        }

        if self.match_token(&TokenKind::Null) {
            return Ok(Expr::Null);
        }

        if self.match_token(&TokenKind::Undefined) {
            return Ok(Expr::Undefined);
        }

        if let Some(TokenKind::Ident(name)) = self.peek_kind() {
            let name = name.clone();
            self.advance();
            return Ok(Expr::Ident(name));
        }

        if self.match_token(&TokenKind::LParen) {
            let expr = self.expression()?;
            self.expect(&TokenKind::RParen)?;
            return Ok(expr);
        }

        Err(self.error("expected expression"))
    }

    // Helper methods

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.current)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek_kind(), Some(TokenKind::Eof) | None)
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == Some(kind)
    }

    fn advance(&mut self) -> Option<&Token> {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.tokens.get(self.current - 1)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), String> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("expected {:?}", kind)))
        }
    }

    fn expect_ident(&mut self) -> Result<String, String> {
        if let Some(TokenKind::Ident(name)) = self.peek_kind() {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(self.error("expected identifier"))
        }
    }

    fn current_span(&self) -> Span {
        self.peek().map(|t| t.span).unwrap_or(Span::new(1, 1))
    }

    fn error(&self, message: &str) -> String {
        let span = self.current_span();
        format!(
            "error: {}\n  --> {}:{}:{}",
            message, self.filename, span.line, span.column
        )
    }
}
