//! Recursive-descent parser over the token stream.

use std::rc::Rc;

use crate::ast::*;
use crate::error::EngineError;
use crate::lexer::{tokenize, Token};

const KEYWORDS: &[&str] = &[
    "var", "let", "const", "function", "return", "if", "else", "while", "for", "break", "continue",
    "throw", "try", "catch", "finally", "new", "typeof", "delete", "void", "true", "false", "null",
    "this", "async", "import", "export", "from", "as", "instanceof", "in",
];

pub fn parse_program(source: &str) -> Result<Program, EngineError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut body = Vec::new();
    while !parser.at_eof() {
        body.push(parser.statement()?);
    }
    Ok(Program { body })
}

struct Parser {
    tokens: Vec<(Token, u32)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].0
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos.min(self.tokens.len() - 1)].1
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].0.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> EngineError {
        EngineError::Syntax(format!("{} (line {})", message.into(), self.line()))
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.peek().is_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), EngineError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", p)))
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.peek().is_ident(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self) -> Result<String, EngineError> {
        match self.advance() {
            Token::Ident(name) if !KEYWORDS.contains(&name.as_str()) => Ok(name),
            other => Err(self.error(format!("expected identifier, found {:?}", other))),
        }
    }

    fn eat_semi(&mut self) {
        // Semicolons are optional in the subset; consume when present.
        while self.eat_punct(";") {}
    }

    // ---- Statements ----

    fn statement(&mut self) -> Result<Stmt, EngineError> {
        if self.eat_punct(";") {
            return Ok(Stmt::Empty);
        }
        if self.peek().is_punct("{") {
            self.advance();
            let body = self.block_body()?;
            return Ok(Stmt::Block(body));
        }
        match self.peek().clone() {
            Token::Ident(kw) => match kw.as_str() {
                "var" | "let" | "const" => self.var_decl(),
                "function" => {
                    self.advance();
                    let literal = self.function_rest(false, true)?;
                    Ok(Stmt::Func(literal))
                }
                "async" if self.peek_at(1).is_ident("function") => {
                    self.advance();
                    self.advance();
                    let literal = self.function_rest(true, true)?;
                    Ok(Stmt::Func(literal))
                }
                "return" => {
                    self.advance();
                    if self.peek().is_punct(";") || self.peek().is_punct("}") || self.at_eof() {
                        self.eat_semi();
                        Ok(Stmt::Return(None))
                    } else {
                        let value = self.expression()?;
                        self.eat_semi();
                        Ok(Stmt::Return(Some(value)))
                    }
                }
                "if" => self.if_stmt(),
                "while" => self.while_stmt(),
                "for" => self.for_stmt(),
                "break" => {
                    self.advance();
                    self.eat_semi();
                    Ok(Stmt::Break)
                }
                "continue" => {
                    self.advance();
                    self.eat_semi();
                    Ok(Stmt::Continue)
                }
                "throw" => {
                    self.advance();
                    let value = self.expression()?;
                    self.eat_semi();
                    Ok(Stmt::Throw(value))
                }
                "try" => self.try_stmt(),
                "import" => self.import_stmt(),
                "export" => self.export_stmt(),
                _ => {
                    let expr = self.expression()?;
                    self.eat_semi();
                    Ok(Stmt::Expr(expr))
                }
            },
            _ => {
                let expr = self.expression()?;
                self.eat_semi();
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn block_body(&mut self) -> Result<Vec<Stmt>, EngineError> {
        let mut body = Vec::new();
        while !self.peek().is_punct("}") {
            if self.at_eof() {
                return Err(self.error("unterminated block"));
            }
            body.push(self.statement()?);
        }
        self.expect_punct("}")?;
        Ok(body)
    }

    fn var_decl(&mut self) -> Result<Stmt, EngineError> {
        let kind = match self.advance() {
            Token::Ident(kw) => match kw.as_str() {
                "var" => DeclKind::Var,
                "let" => DeclKind::Let,
                _ => DeclKind::Const,
            },
            _ => return Err(self.error("expected declaration keyword")),
        };
        // Multiple declarators become a block of declarations.
        let mut decls = Vec::new();
        loop {
            let name = self.expect_ident()?;
            let init = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            decls.push(Stmt::VarDecl {
                kind,
                name,
                init,
            });
            if !self.eat_punct(",") {
                break;
            }
        }
        self.eat_semi();
        if decls.len() == 1 {
            decls.pop().ok_or_else(|| self.error("empty declaration"))
        } else {
            Ok(Stmt::Multi(decls))
        }
    }

    fn if_stmt(&mut self) -> Result<Stmt, EngineError> {
        self.advance();
        self.expect_punct("(")?;
        let cond = self.expression()?;
        self.expect_punct(")")?;
        let cons = Box::new(self.statement()?);
        let alt = if self.eat_keyword("else") {
            Some(Box::new(self.statement()?))
        } else {
            None
        };
        Ok(Stmt::If { cond, cons, alt })
    }

    fn while_stmt(&mut self) -> Result<Stmt, EngineError> {
        self.advance();
        self.expect_punct("(")?;
        let cond = self.expression()?;
        self.expect_punct(")")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::While { cond, body })
    }

    fn for_stmt(&mut self) -> Result<Stmt, EngineError> {
        self.advance();
        self.expect_punct("(")?;
        let init = if self.peek().is_punct(";") {
            self.advance();
            None
        } else {
            let stmt = if matches!(self.peek(), Token::Ident(kw) if kw == "var" || kw == "let" || kw == "const")
            {
                self.var_decl()?
            } else {
                let expr = self.expression()?;
                self.eat_semi();
                Stmt::Expr(expr)
            };
            Some(Box::new(stmt))
        };
        let cond = if self.peek().is_punct(";") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(";")?;
        let update = if self.peek().is_punct(")") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(")")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::For {
            init,
            cond,
            update,
            body,
        })
    }

    fn try_stmt(&mut self) -> Result<Stmt, EngineError> {
        self.advance();
        self.expect_punct("{")?;
        let block = self.block_body()?;
        let mut param = None;
        let mut handler = None;
        if self.eat_keyword("catch") {
            if self.eat_punct("(") {
                param = Some(self.expect_ident()?);
                self.expect_punct(")")?;
            }
            self.expect_punct("{")?;
            handler = Some(self.block_body()?);
        }
        let finalizer = if self.eat_keyword("finally") {
            self.expect_punct("{")?;
            Some(self.block_body()?)
        } else {
            None
        };
        if handler.is_none() && finalizer.is_none() {
            return Err(self.error("try without catch or finally"));
        }
        Ok(Stmt::Try {
            block,
            param,
            handler,
            finalizer,
        })
    }

    fn import_stmt(&mut self) -> Result<Stmt, EngineError> {
        self.advance();
        let mut named = Vec::new();
        let mut namespace = None;
        if self.eat_punct("*") {
            if !self.eat_keyword("as") {
                return Err(self.error("expected 'as' in namespace import"));
            }
            namespace = Some(self.expect_ident()?);
        } else if self.eat_punct("{") {
            while !self.peek().is_punct("}") {
                let imported = self.expect_ident()?;
                let local = if self.eat_keyword("as") {
                    self.expect_ident()?
                } else {
                    imported.clone()
                };
                named.push((imported, local));
                if !self.eat_punct(",") {
                    break;
                }
            }
            self.expect_punct("}")?;
        } else {
            // Default import binds the namespace's `default` export.
            let local = self.expect_ident()?;
            named.push(("default".to_string(), local));
        }
        if !self.eat_keyword("from") {
            return Err(self.error("expected 'from' in import"));
        }
        let source = match self.advance() {
            Token::Str(s) => s,
            _ => return Err(self.error("expected module specifier string")),
        };
        self.eat_semi();
        Ok(Stmt::Import {
            named,
            namespace,
            source,
        })
    }

    fn export_stmt(&mut self) -> Result<Stmt, EngineError> {
        self.advance();
        if self.eat_punct("{") {
            let mut names = Vec::new();
            while !self.peek().is_punct("}") {
                let local = self.expect_ident()?;
                let exported = if self.eat_keyword("as") {
                    self.expect_ident()?
                } else {
                    local.clone()
                };
                names.push((local, exported));
                if !self.eat_punct(",") {
                    break;
                }
            }
            self.expect_punct("}")?;
            self.eat_semi();
            return Ok(Stmt::ExportNamed(names));
        }
        if self.eat_keyword("default") {
            let value = self.assignment()?;
            self.eat_semi();
            // `export default <expr>` is a const binding named "default".
            return Ok(Stmt::ExportDecl(Box::new(Stmt::VarDecl {
                kind: DeclKind::Const,
                name: "default".to_string(),
                init: Some(value),
            })));
        }
        let decl = self.statement()?;
        match &decl {
            Stmt::VarDecl { .. } | Stmt::Func(_) | Stmt::Block(_) => {}
            _ => return Err(self.error("unsupported export declaration")),
        }
        Ok(Stmt::ExportDecl(Box::new(decl)))
    }

    /// Parse the remainder of a function after `function` / `async function`.
    fn function_rest(
        &mut self,
        is_async: bool,
        named: bool,
    ) -> Result<Rc<FunctionLiteral>, EngineError> {
        let name = if named {
            match self.peek() {
                Token::Ident(n) if !KEYWORDS.contains(&n.as_str()) => {
                    let n = n.clone();
                    self.advance();
                    Some(n)
                }
                _ => None,
            }
        } else {
            None
        };
        self.expect_punct("(")?;
        let params = self.param_list()?;
        self.expect_punct("{")?;
        let body = self.block_body()?;
        Ok(Rc::new(FunctionLiteral {
            name,
            params,
            body: Rc::new(body),
            is_async,
            is_arrow: false,
        }))
    }

    fn param_list(&mut self) -> Result<Vec<String>, EngineError> {
        let mut params = Vec::new();
        while !self.peek().is_punct(")") {
            params.push(self.expect_ident()?);
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(params)
    }

    // ---- Expressions ----

    fn expression(&mut self) -> Result<Expr, EngineError> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr, EngineError> {
        if let Some(arrow) = self.try_arrow_function()? {
            return Ok(arrow);
        }
        let left = self.conditional()?;
        let op = if self.peek().is_punct("=") {
            Some(AssignOp::Assign)
        } else if self.peek().is_punct("+=") {
            Some(AssignOp::Add)
        } else if self.peek().is_punct("-=") {
            Some(AssignOp::Sub)
        } else if self.peek().is_punct("*=") {
            Some(AssignOp::Mul)
        } else if self.peek().is_punct("/=") {
            Some(AssignOp::Div)
        } else if self.peek().is_punct("%=") {
            Some(AssignOp::Rem)
        } else {
            None
        };
        if let Some(op) = op {
            match &left {
                Expr::Ident(_) | Expr::Member { .. } => {}
                _ => return Err(self.error("invalid assignment target")),
            }
            self.advance();
            let value = self.assignment()?;
            return Ok(Expr::Assign {
                op,
                target: Box::new(left),
                value: Box::new(value),
            });
        }
        Ok(left)
    }

    /// Arrow functions need lookahead: `x => ...`, `() => ...`, `(a, b) => ...`,
    /// optionally prefixed with `async`. Backtracks on failure.
    fn try_arrow_function(&mut self) -> Result<Option<Expr>, EngineError> {
        let start = self.pos;
        let is_async = if self.peek().is_ident("async")
            && (matches!(self.peek_at(1), Token::Ident(n) if !KEYWORDS.contains(&n.as_str()))
                || self.peek_at(1).is_punct("("))
        {
            self.advance();
            true
        } else {
            false
        };

        let params = match self.peek().clone() {
            Token::Ident(name) if !KEYWORDS.contains(&name.as_str()) => {
                if self.peek_at(1).is_punct("=>") {
                    self.advance();
                    vec![name]
                } else {
                    self.pos = start;
                    return Ok(None);
                }
            }
            Token::Punct("(") => {
                // Scan ahead for `)` followed by `=>` before committing.
                let mut depth = 0usize;
                let mut offset = 0usize;
                let close = loop {
                    match self.peek_at(offset) {
                        Token::Punct("(") => depth += 1,
                        Token::Punct(")") => {
                            depth -= 1;
                            if depth == 0 {
                                break offset;
                            }
                        }
                        Token::Eof => {
                            self.pos = start;
                            return Ok(None);
                        }
                        _ => {}
                    }
                    offset += 1;
                };
                if !self.peek_at(close + 1).is_punct("=>") {
                    self.pos = start;
                    return Ok(None);
                }
                self.advance(); // (
                let params = self.param_list()?;
                params
            }
            _ => {
                self.pos = start;
                return Ok(None);
            }
        };

        if !self.eat_punct("=>") {
            self.pos = start;
            return Ok(None);
        }

        let body = if self.eat_punct("{") {
            self.block_body()?
        } else {
            let expr = self.assignment()?;
            vec![Stmt::Return(Some(expr))]
        };
        Ok(Some(Expr::Func(Rc::new(FunctionLiteral {
            name: None,
            params,
            body: Rc::new(body),
            is_async,
            is_arrow: true,
        }))))
    }

    fn conditional(&mut self) -> Result<Expr, EngineError> {
        let test = self.logical_or()?;
        if self.eat_punct("?") {
            let cons = self.assignment()?;
            self.expect_punct(":")?;
            let alt = self.assignment()?;
            return Ok(Expr::Cond {
                test: Box::new(test),
                cons: Box::new(cons),
                alt: Box::new(alt),
            });
        }
        Ok(test)
    }

    fn logical_or(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.logical_and()?;
        loop {
            let op = if self.peek().is_punct("||") {
                LogicalOp::Or
            } else if self.peek().is_punct("??") {
                LogicalOp::Nullish
            } else {
                return Ok(left);
            };
            self.advance();
            let right = self.logical_and()?;
            left = Expr::Logical {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn logical_and(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.equality()?;
        while self.peek().is_punct("&&") {
            self.advance();
            let right = self.equality()?;
            left = Expr::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.relational()?;
        loop {
            let op = if self.peek().is_punct("===") {
                BinaryOp::EqStrict
            } else if self.peek().is_punct("!==") {
                BinaryOp::NeStrict
            } else if self.peek().is_punct("==") {
                BinaryOp::EqLoose
            } else if self.peek().is_punct("!=") {
                BinaryOp::NeLoose
            } else {
                return Ok(left);
            };
            self.advance();
            let right = self.relational()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn relational(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.additive()?;
        loop {
            let op = if self.peek().is_punct("<=") {
                BinaryOp::Le
            } else if self.peek().is_punct(">=") {
                BinaryOp::Ge
            } else if self.peek().is_punct("<") {
                BinaryOp::Lt
            } else if self.peek().is_punct(">") {
                BinaryOp::Gt
            } else if self.peek().is_ident("instanceof") {
                BinaryOp::InstanceOf
            } else if self.peek().is_ident("in") {
                BinaryOp::In
            } else {
                return Ok(left);
            };
            self.advance();
            let right = self.additive()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn additive(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = if self.peek().is_punct("+") {
                BinaryOp::Add
            } else if self.peek().is_punct("-") {
                BinaryOp::Sub
            } else {
                return Ok(left);
            };
            self.advance();
            let right = self.multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.unary()?;
        loop {
            let op = if self.peek().is_punct("**") {
                BinaryOp::Pow
            } else if self.peek().is_punct("*") {
                BinaryOp::Mul
            } else if self.peek().is_punct("/") {
                BinaryOp::Div
            } else if self.peek().is_punct("%") {
                BinaryOp::Rem
            } else {
                return Ok(left);
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, EngineError> {
        let op = if self.peek().is_punct("!") {
            Some(UnaryOp::Not)
        } else if self.peek().is_punct("-") {
            Some(UnaryOp::Neg)
        } else if self.peek().is_punct("+") {
            Some(UnaryOp::Plus)
        } else if self.peek().is_ident("typeof") {
            Some(UnaryOp::TypeOf)
        } else if self.peek().is_ident("delete") {
            Some(UnaryOp::Delete)
        } else if self.peek().is_ident("void") {
            Some(UnaryOp::Void)
        } else {
            None
        };
        if let Some(op) = op {
            self.advance();
            let expr = self.unary()?;
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
            });
        }
        if self.peek().is_punct("++") || self.peek().is_punct("--") {
            let increment = self.peek().is_punct("++");
            self.advance();
            let target = self.unary()?;
            return Ok(Expr::Update {
                prefix: true,
                increment,
                target: Box::new(target),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, EngineError> {
        let expr = self.call_member()?;
        if self.peek().is_punct("++") || self.peek().is_punct("--") {
            let increment = self.peek().is_punct("++");
            self.advance();
            return Ok(Expr::Update {
                prefix: false,
                increment,
                target: Box::new(expr),
            });
        }
        Ok(expr)
    }

    fn call_member(&mut self) -> Result<Expr, EngineError> {
        let mut expr = if self.eat_keyword("new") {
            let callee = self.member_only()?;
            let args = if self.eat_punct("(") {
                self.arg_list()?
            } else {
                Vec::new()
            };
            Expr::New {
                callee: Box::new(callee),
                args,
            }
        } else {
            self.primary()?
        };
        loop {
            if self.eat_punct(".") {
                let name = match self.advance() {
                    Token::Ident(n) => n,
                    _ => return Err(self.error("expected property name")),
                };
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: MemberKey::Static(name),
                };
            } else if self.eat_punct("[") {
                let key = self.expression()?;
                self.expect_punct("]")?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: MemberKey::Computed(Box::new(key)),
                };
            } else if self.eat_punct("(") {
                let args = self.arg_list()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    /// Member chain without call — the callee of `new`.
    fn member_only(&mut self) -> Result<Expr, EngineError> {
        let mut expr = self.primary()?;
        while self.eat_punct(".") {
            let name = match self.advance() {
                Token::Ident(n) => n,
                _ => return Err(self.error("expected property name")),
            };
            expr = Expr::Member {
                object: Box::new(expr),
                property: MemberKey::Static(name),
            };
        }
        Ok(expr)
    }

    fn arg_list(&mut self) -> Result<Vec<Expr>, EngineError> {
        let mut args = Vec::new();
        while !self.peek().is_punct(")") {
            args.push(self.assignment()?);
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, EngineError> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::BigInt(b) => Ok(Expr::BigInt(b)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Punct("(") => {
                let expr = self.expression()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            Token::Punct("[") => {
                let mut items = Vec::new();
                while !self.peek().is_punct("]") {
                    items.push(self.assignment()?);
                    if !self.eat_punct(",") {
                        break;
                    }
                }
                self.expect_punct("]")?;
                Ok(Expr::Array(items))
            }
            Token::Punct("{") => {
                let mut props = Vec::new();
                while !self.peek().is_punct("}") {
                    let key = match self.advance() {
                        Token::Ident(n) => n,
                        Token::Str(s) => s,
                        Token::Number(n) => crate::value::number_to_string(n),
                        _ => return Err(self.error("expected property key")),
                    };
                    if self.eat_punct(":") {
                        let value = self.assignment()?;
                        props.push((key, value));
                    } else {
                        // Shorthand `{ key }`.
                        props.push((key.clone(), Expr::Ident(key)));
                    }
                    if !self.eat_punct(",") {
                        break;
                    }
                }
                self.expect_punct("}")?;
                Ok(Expr::ObjectLit(props))
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                "this" => Ok(Expr::This),
                "function" => {
                    let literal = self.function_rest(false, true)?;
                    Ok(Expr::Func(literal))
                }
                "async" if self.peek().is_ident("function") => {
                    self.advance();
                    let literal = self.function_rest(true, true)?;
                    Ok(Expr::Func(literal))
                }
                _ if KEYWORDS.contains(&name.as_str()) => {
                    Err(self.error(format!("unexpected keyword '{}'", name)))
                }
                _ => Ok(Expr::Ident(name)),
            },
            other => Err(self.error(format!("unexpected token {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arithmetic() {
        let program = parse_program("40 + 2").unwrap();
        assert_eq!(program.body.len(), 1);
        assert!(matches!(
            program.body[0],
            Stmt::Expr(Expr::Binary {
                op: BinaryOp::Add,
                ..
            })
        ));
    }

    #[test]
    fn parses_arrow() {
        let program = parse_program("(x) => x.toUpperCase()").unwrap();
        match &program.body[0] {
            Stmt::Expr(Expr::Func(f)) => {
                assert!(f.is_arrow);
                assert_eq!(f.params, vec!["x".to_string()]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn parses_async_arrow() {
        let program = parse_program("async () => 7").unwrap();
        match &program.body[0] {
            Stmt::Expr(Expr::Func(f)) => {
                assert!(f.is_async);
                assert!(f.is_arrow);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn parses_while_and_compound_assign() {
        let program = parse_program("let s = 'a'; while (true) s += s;").unwrap();
        assert_eq!(program.body.len(), 2);
        assert!(matches!(program.body[1], Stmt::While { .. }));
    }

    #[test]
    fn parses_imports_exports() {
        let program =
            parse_program("import { a as b } from 'dep'; export const x = 1;").unwrap();
        assert!(matches!(program.body[0], Stmt::Import { .. }));
        assert!(matches!(program.body[1], Stmt::ExportDecl(_)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_program("let = = 3").is_err());
    }

    #[test]
    fn parses_new_and_members() {
        let program = parse_program("new Promise((res) => { res(1); })").unwrap();
        assert!(matches!(program.body[0], Stmt::Expr(Expr::New { .. })));
    }

    #[test]
    fn parses_try_catch() {
        let program = parse_program("try { f(); } catch (e) { g(e); } finally { h(); }").unwrap();
        assert!(matches!(program.body[0], Stmt::Try { .. }));
    }
}
