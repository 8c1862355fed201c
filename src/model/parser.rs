// Tokenizer + recursive-descent parser for the model equation language.
use crate::model::ast::{Expr, Lhs, ParseError, Stmt, Token};

pub(crate) fn tokenize(text: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let mut pos = 0usize;
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c.is_ascii_digit() || c == '.' {
            let mut num = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit()
                    || d == '.'
                    || d == 'e'
                    || d == 'E'
                    || ((d == '+' || d == '-') && (num.ends_with('e') || num.ends_with('E')))
                {
                    num.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            match num.parse::<f64>() {
                Ok(v) => tokens.push(Token::Num(v)),
                Err(_) => {
                    return Err(ParseError {
                        pos,
                        found: Some(num),
                        expected: "a number",
                    })
                }
            }
            pos += 1;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let mut id = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_alphanumeric() || d == '_' {
                    id.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Ident(id));
            pos += 1;
            continue;
        }
        chars.next();
        let token = match c {
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            ';' => Token::Semicolon,
            '=' => Token::Assign,
            '+' | '-' | '*' | '/' | '^' => Token::Op(c),
            other => {
                return Err(ParseError {
                    pos,
                    found: Some(other.to_string()),
                    expected: "an operator, bracket or identifier",
                })
            }
        };
        tokens.push(token);
        pos += 1;
    }
    Ok(tokens)
}

pub(crate) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub(crate) fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, expected: &'static str) -> ParseError {
        ParseError {
            pos: self.pos,
            found: self.peek().map(|token| format!("{:?}", token)),
            expected,
        }
    }

    fn expect(&mut self, token: Token, expected: &'static str) -> Result<(), ParseError> {
        if self.peek() == Some(&token) {
            self.next();
            Ok(())
        } else {
            Err(self.error(expected))
        }
    }

    /// Parse a `;`-separated sequence of assignment statements
    pub(crate) fn parse_statements(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut statements = Vec::new();
        while self.peek().is_some() {
            statements.push(self.parse_statement()?);
        }
        Ok(statements)
    }

    fn parse_statement(&mut self) -> Result<Stmt, ParseError> {
        let lhs = match self.next() {
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LBracket) {
                    self.next();
                    let index = match self.next() {
                        Some(Token::Num(v)) if v >= 0.0 && v.fract() == 0.0 => v as usize,
                        _ => return Err(self.error("an integer compartment index")),
                    };
                    self.expect(Token::RBracket, "`]`")?;
                    Lhs::Indexed { name, index }
                } else {
                    Lhs::Ident(name)
                }
            }
            _ => return Err(self.error("an assignment target")),
        };
        self.expect(Token::Assign, "`=`")?;
        let rhs = self.parse_expr()?;
        self.expect(Token::Semicolon, "`;`")?;
        Ok(Stmt { lhs, rhs })
    }

    /// Parse a single expression, requiring that all tokens are consumed
    pub(crate) fn parse_full_expr(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_expr()?;
        if self.peek().is_some() {
            return Err(self.error("end of expression"));
        }
        Ok(expr)
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_add_sub()
    }

    fn parse_add_sub(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_mul_div()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.next();
            let rhs = self.parse_mul_div()?;
            node = Expr::Binary {
                op: if op == '+' {
                    crate::model::ast::BinOp::Add
                } else {
                    crate::model::ast::BinOp::Sub
                },
                lhs: Box::new(node),
                rhs: Box::new(rhs),
            };
        }
        Ok(node)
    }

    fn parse_mul_div(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_power()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek().cloned() {
            self.next();
            let rhs = self.parse_power()?;
            node = Expr::Binary {
                op: if op == '*' {
                    crate::model::ast::BinOp::Mul
                } else {
                    crate::model::ast::BinOp::Div
                },
                lhs: Box::new(node),
                rhs: Box::new(rhs),
            };
        }
        Ok(node)
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let node = self.parse_unary()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.next();
            // right-associative
            let rhs = self.parse_power()?;
            return Ok(Expr::Binary {
                op: crate::model::ast::BinOp::Pow,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
            });
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if let Some(Token::Op('-')) = self.peek() {
            self.next();
            let rhs = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(rhs)));
        }
        if let Some(Token::Op('+')) = self.peek() {
            self.next();
            return self.parse_unary();
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.next() {
            Some(Token::Num(v)) => Ok(Expr::Number(v)),
            Some(Token::Ident(id)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.next();
                    let mut args = Vec::new();
                    if self.peek() == Some(&Token::RParen) {
                        self.next();
                    } else {
                        loop {
                            args.push(self.parse_expr()?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.next();
                                }
                                Some(Token::RParen) => {
                                    self.next();
                                    break;
                                }
                                _ => return Err(self.error("`,` or `)`")),
                            }
                        }
                    }
                    Ok(Expr::Call { name: id, args })
                } else if self.peek() == Some(&Token::LBracket) {
                    self.next();
                    let index = match self.next() {
                        Some(Token::Num(v)) if v >= 0.0 && v.fract() == 0.0 => v as usize,
                        _ => return Err(self.error("an integer compartment index")),
                    };
                    self.expect(Token::RBracket, "`]`")?;
                    Ok(Expr::Indexed { name: id, index })
                } else {
                    Ok(Expr::Ident(id))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expr()?;
                self.expect(Token::RParen, "`)`")?;
                Ok(expr)
            }
            _ => Err(self.error("a number, identifier or `(`")),
        }
    }
}

/// Parse a block of `;`-terminated assignment statements
pub(crate) fn parse_statements(text: &str) -> Result<Vec<Stmt>, ParseError> {
    let tokens = tokenize(text)?;
    Parser::new(tokens).parse_statements()
}

/// Parse a single expression (e.g. an observation scale)
pub(crate) fn parse_expression(text: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(text)?;
    Parser::new(tokens).parse_full_expr()
}
