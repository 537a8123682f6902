// THEORY:
// User programs carry small pieces of text: a move command's `x` field, a variable test,
// a custom script. This module turns that text into a tree and nothing more. It knows no
// variables and calls nothing; evaluation lives in `namespace`.
//
// Key architectural principles:
// 1.  **Closed grammar**: Numbers, booleans, strings, names, dotted handle paths, calls,
//     arithmetic, comparisons and boolean logic. There is no syntax for defining
//     functions, importing, indexing or looping, so no input can reach outside the
//     evaluator's function table and host handles.
// 2.  **Pratt parsing**: Binary operator precedence and associativity come from one table
//     (`binary_op_info`). Unary operators bind looser than `**`, so `-2 ** 2` is `-4`.
// 3.  **Statements**: A script is a list of assignments and expression statements
//     separated by newlines or `;`. Newlines inside parentheses are ignored and `#`
//     starts a comment.

use crate::error::EvalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Bool(bool),
    Text(String),
    Name(String),
    /// A dotted handle path read without a call, e.g. `settings.robotID`.
    Attribute(Vec<String>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `path[0]` alone for plain functions, longer for handle calls like `robot.set_pos`.
    Call {
        path: Vec<String>,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Assign {
        name: String,
        op: AssignOp,
        value: Expr,
    },
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Text(String),
    True,
    False,
    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    DoubleStar,
    EqEq,
    BangEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Not,
    LParen,
    RParen,
    Comma,
    Dot,
    Assign(AssignOp),
    Separator,
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, EvalError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        let next = chars.get(i + 1).copied();

        if c == '\n' || c == ';' {
            if depth == 0 {
                tokens.push((Token::Separator, start));
            }
            i += 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '#' {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) {
            let (value, end) = lex_number(&chars, i)?;
            tokens.push((Token::Number(value), start));
            i = end;
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let token = match word.as_str() {
                "and" => Token::And,
                "or" => Token::Or,
                "not" => Token::Not,
                "True" | "true" => Token::True,
                "False" | "false" => Token::False,
                _ => Token::Ident(word),
            };
            tokens.push((token, start));
            continue;
        }
        if c == '"' || c == '\'' {
            i += 1;
            let mut text = String::new();
            loop {
                match chars.get(i) {
                    None | Some('\n') => return Err(EvalError::parse("unterminated string", start)),
                    Some(&q) if q == c => break,
                    Some('\\') => {
                        match chars.get(i + 1) {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(&other) => text.push(other),
                            None => return Err(EvalError::parse("unterminated string", start)),
                        }
                        i += 2;
                        continue;
                    }
                    Some(&other) => text.push(other),
                }
                i += 1;
            }
            tokens.push((Token::Text(text), start));
            i += 1;
            continue;
        }

        let (token, width) = match (c, next) {
            ('*', Some('*')) => (Token::DoubleStar, 2),
            ('/', Some('/')) => (Token::DoubleSlash, 2),
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::BangEq, 2),
            ('<', Some('=')) => (Token::LtEq, 2),
            ('>', Some('=')) => (Token::GtEq, 2),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('+', Some('=')) => (Token::Assign(AssignOp::Add), 2),
            ('-', Some('=')) => (Token::Assign(AssignOp::Sub), 2),
            ('*', Some('=')) => (Token::Assign(AssignOp::Mul), 2),
            ('/', Some('=')) => (Token::Assign(AssignOp::Div), 2),
            ('=', _) => (Token::Assign(AssignOp::Set), 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('!', _) => (Token::Not, 1),
            ('(', _) => {
                depth += 1;
                (Token::LParen, 1)
            }
            (')', _) => {
                depth = depth.saturating_sub(1);
                (Token::RParen, 1)
            }
            (',', _) => (Token::Comma, 1),
            ('.', _) => (Token::Dot, 1),
            _ => return Err(EvalError::parse(format!("unexpected character '{c}'"), start)),
        };
        tokens.push((token, start));
        i += width;
    }
    Ok(tokens)
}

fn lex_number(chars: &[char], start: usize) -> Result<(f64, usize), EvalError> {
    let mut i = start;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    if i < chars.len() && chars[i] == '.' {
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
        let mut j = i + 1;
        if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    let text: String = chars[start..i].iter().collect();
    text.parse::<f64>()
        .map(|value| (value, i))
        .map_err(|_| EvalError::parse(format!("invalid number '{text}'"), start))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Assoc {
    Left,
    Right,
}

/// (precedence, associativity, op); higher precedence binds tighter.
fn binary_op_info(token: &Token) -> Option<(u8, Assoc, BinaryOp)> {
    match token {
        Token::Or => Some((10, Assoc::Left, BinaryOp::Or)),
        Token::And => Some((20, Assoc::Left, BinaryOp::And)),
        Token::EqEq => Some((30, Assoc::Left, BinaryOp::Eq)),
        Token::BangEq => Some((30, Assoc::Left, BinaryOp::Ne)),
        Token::Lt => Some((30, Assoc::Left, BinaryOp::Lt)),
        Token::LtEq => Some((30, Assoc::Left, BinaryOp::Le)),
        Token::Gt => Some((30, Assoc::Left, BinaryOp::Gt)),
        Token::GtEq => Some((30, Assoc::Left, BinaryOp::Ge)),
        Token::Plus => Some((40, Assoc::Left, BinaryOp::Add)),
        Token::Minus => Some((40, Assoc::Left, BinaryOp::Sub)),
        Token::Star => Some((50, Assoc::Left, BinaryOp::Mul)),
        Token::Slash => Some((50, Assoc::Left, BinaryOp::Div)),
        Token::DoubleSlash => Some((50, Assoc::Left, BinaryOp::FloorDiv)),
        Token::Percent => Some((50, Assoc::Left, BinaryOp::Mod)),
        Token::DoubleStar => Some((70, Assoc::Right, BinaryOp::Pow)),
        _ => None,
    }
}

/// Operand precedence of `not`: it takes a whole comparison.
const NOT_OPERAND_PREC: u8 = 30;
/// Operand precedence of unary `-`/`+`: tighter than `*`, looser than `**`.
const SIGN_OPERAND_PREC: u8 = 60;

/// Bound on both parser recursion and the height of the parsed tree. Evaluation walks
/// the tree recursively, so this also bounds the evaluator's stack use.
pub const MAX_NESTING: usize = 256;

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn new(source: &str) -> Result<Self, EvalError> {
        Ok(Self {
            tokens: tokenize(source)?,
            pos: 0,
            end: source.chars().count(),
            depth: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(t, _)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, p)| *p).unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), EvalError> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn unexpected(&self, what: &str) -> EvalError {
        match self.peek() {
            Some(token) => EvalError::parse(format!("expected {what}, found {token:?}"), self.position()),
            None => EvalError::parse(format!("expected {what}, found end of input"), self.position()),
        }
    }

    fn skip_separators(&mut self) {
        while self.peek() == Some(&Token::Separator) {
            self.pos += 1;
        }
    }

    fn too_deep(&self) -> EvalError {
        EvalError::parse("expression is nested too deeply", self.position())
    }

    /// Height of a node over children at most `height` tall.
    fn grow(&self, height: usize) -> Result<usize, EvalError> {
        if height >= MAX_NESTING {
            return Err(self.too_deep());
        }
        Ok(height + 1)
    }

    /// Parses an expression and returns it with its tree height.
    fn parse_pratt(&mut self, min_prec: u8) -> Result<(Expr, usize), EvalError> {
        if self.depth >= MAX_NESTING {
            return Err(self.too_deep());
        }
        self.depth += 1;
        let result = self.parse_binary(min_prec);
        self.depth -= 1;
        result
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<(Expr, usize), EvalError> {
        let (mut left, mut height) = self.parse_prefix()?;

        while let Some(token) = self.peek() {
            let Some((prec, assoc, op)) = binary_op_info(token) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let next_prec = if assoc == Assoc::Left { prec + 1 } else { prec };
            let (right, right_height) = self.parse_pratt(next_prec)?;
            height = self.grow(height.max(right_height))?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok((left, height))
    }

    fn parse_prefix(&mut self) -> Result<(Expr, usize), EvalError> {
        let (op, prec) = match self.peek() {
            Some(Token::Minus) => (UnaryOp::Neg, SIGN_OPERAND_PREC),
            Some(Token::Plus) => (UnaryOp::Pos, SIGN_OPERAND_PREC),
            Some(Token::Not) => (UnaryOp::Not, NOT_OPERAND_PREC),
            _ => return self.parse_postfix(),
        };
        self.pos += 1;
        let (operand, height) = self.parse_pratt(prec)?;
        let height = self.grow(height)?;
        let unary = Expr::Unary {
            op,
            operand: Box::new(operand),
        };
        Ok((unary, height))
    }

    fn parse_postfix(&mut self) -> Result<(Expr, usize), EvalError> {
        let position = self.position();
        let name = match self.advance() {
            Some(Token::Number(value)) => return Ok((Expr::Number(value), 1)),
            Some(Token::True) => return Ok((Expr::Bool(true), 1)),
            Some(Token::False) => return Ok((Expr::Bool(false), 1)),
            Some(Token::Text(text)) => return Ok((Expr::Text(text), 1)),
            Some(Token::LParen) => {
                let inner = self.parse_pratt(0)?;
                self.expect(Token::RParen, "')'")?;
                if self.peek() == Some(&Token::LParen) {
                    return Err(EvalError::parse("only named functions can be called", self.position()));
                }
                return Ok(inner);
            }
            Some(Token::Ident(name)) => name,
            Some(token) => {
                return Err(EvalError::parse(format!("unexpected {token:?}"), position));
            }
            None => return Err(EvalError::parse("unexpected end of input", position)),
        };

        let mut path = vec![name];
        while self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            match self.advance() {
                Some(Token::Ident(field)) => path.push(field),
                _ => return Err(EvalError::parse("expected a name after '.'", self.position())),
            }
        }

        if self.peek() == Some(&Token::LParen) {
            let (args, height) = self.parse_call_args()?;
            let height = self.grow(height)?;
            return Ok((Expr::Call { path, args }, height));
        }
        if path.len() == 1 {
            Ok((Expr::Name(path.remove(0)), 1))
        } else {
            Ok((Expr::Attribute(path), 1))
        }
    }

    /// The arguments and the height of the tallest one.
    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, usize), EvalError> {
        self.expect(Token::LParen, "'('")?;
        let mut args = Vec::new();
        let mut height = 0;
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok((args, height));
        }
        loop {
            let (arg, arg_height) = self.parse_pratt(0)?;
            args.push(arg);
            height = height.max(arg_height);
            match self.advance() {
                Some(Token::Comma) => {
                    if self.peek() == Some(&Token::RParen) {
                        self.pos += 1;
                        return Ok((args, height));
                    }
                }
                Some(Token::RParen) => return Ok((args, height)),
                _ => return Err(EvalError::parse("expected ',' or ')'", self.position())),
            }
        }
    }

    fn parse_statement(&mut self) -> Result<Statement, EvalError> {
        if let (Some(Token::Ident(name)), Some(Token::Assign(op))) = (self.peek(), self.peek_at(1)) {
            let (name, op) = (name.clone(), *op);
            self.pos += 2;
            let (value, _) = self.parse_pratt(0)?;
            return Ok(Statement::Assign { name, op, value });
        }
        let (expr, _) = self.parse_pratt(0)?;
        Ok(Statement::Expr(expr))
    }
}

/// Parses a single expression. Surrounding whitespace and blank lines are allowed.
pub fn parse_expression(source: &str) -> Result<Expr, EvalError> {
    let mut parser = Parser::new(source)?;
    parser.skip_separators();
    let (expr, _) = parser.parse_pratt(0)?;
    parser.skip_separators();
    if parser.peek().is_some() {
        return Err(parser.unexpected("end of expression"));
    }
    Ok(expr)
}

/// Parses a script into statements.
pub fn parse_script(source: &str) -> Result<Vec<Statement>, EvalError> {
    let mut parser = Parser::new(source)?;
    let mut statements = Vec::new();
    loop {
        parser.skip_separators();
        if parser.peek().is_none() {
            return Ok(statements);
        }
        statements.push(parser.parse_statement()?);
        match parser.peek() {
            None | Some(Token::Separator) => {}
            Some(_) => return Err(parser.unexpected("end of statement")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(value: f64) -> Box<Expr> {
        Box::new(Expr::Number(value))
    }

    #[test]
    fn precedence_follows_arithmetic_rules() {
        assert_eq!(
            parse_expression("1 + 2 * 3").unwrap(),
            Expr::Binary {
                op: BinaryOp::Add,
                left: num(1.0),
                right: Box::new(Expr::Binary { op: BinaryOp::Mul, left: num(2.0), right: num(3.0) }),
            }
        );
    }

    #[test]
    fn power_is_right_associative_and_binds_over_negation() {
        let expr = parse_expression("-2 ** 3 ** 2").unwrap();
        let Expr::Unary { op: UnaryOp::Neg, operand } = expr else {
            panic!("expected negation at the root");
        };
        assert_eq!(
            *operand,
            Expr::Binary {
                op: BinaryOp::Pow,
                left: num(2.0),
                right: Box::new(Expr::Binary { op: BinaryOp::Pow, left: num(3.0), right: num(2.0) }),
            }
        );
    }

    #[test]
    fn not_covers_a_whole_comparison() {
        let expr = parse_expression("not x == 1").unwrap();
        assert!(matches!(
            expr,
            Expr::Unary { op: UnaryOp::Not, ref operand } if matches!(**operand, Expr::Binary { op: BinaryOp::Eq, .. })
        ));
    }

    #[test]
    fn dotted_calls_and_attributes() {
        assert_eq!(
            parse_expression("robot.set_pos(1, 2.5, z)").unwrap(),
            Expr::Call {
                path: vec!["robot".into(), "set_pos".into()],
                args: vec![Expr::Number(1.0), Expr::Number(2.5), Expr::Name("z".into())],
            }
        );
        assert_eq!(
            parse_expression("settings.robotID").unwrap(),
            Expr::Attribute(vec!["settings".into(), "robotID".into()])
        );
    }

    #[test]
    fn numbers_strings_and_booleans() {
        assert_eq!(parse_expression(".5").unwrap(), Expr::Number(0.5));
        assert_eq!(parse_expression("1e3").unwrap(), Expr::Number(1000.0));
        assert_eq!(parse_expression("'Book'").unwrap(), Expr::Text("Book".into()));
        assert_eq!(parse_expression("True").unwrap(), Expr::Bool(true));
    }

    #[test]
    fn malformed_input_is_a_parse_error() {
        for source in ["1 +", "(1", "2 3", "a = 1", "'open", "x @ y", "(f)(1)", ""] {
            assert!(
                matches!(parse_expression(source), Err(EvalError::Parse { .. })),
                "{source:?} should not parse"
            );
        }
    }

    #[test]
    fn deep_nesting_is_rejected_not_overflowed() {
        let depth = 100_000;
        let too_deep = [
            format!("{}1{}", "(".repeat(depth), ")".repeat(depth)),
            format!("{}1", "-".repeat(depth)),
            format!("{}1{}", "abs(".repeat(depth), ")".repeat(depth)),
            format!("1{}", " + 1".repeat(depth)),
            format!("2{}", " ** 2".repeat(depth)),
        ];
        for source in &too_deep {
            assert!(
                matches!(parse_expression(source), Err(EvalError::Parse { ref message, .. }) if message.contains("too deeply")),
                "{}...",
                &source[..20]
            );
        }
    }

    #[test]
    fn nesting_up_to_the_limit_parses() {
        let depth = MAX_NESTING - 1;
        let source = format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(parse_expression(&source).unwrap(), Expr::Number(1.0));
        assert!(parse_expression(&format!("1{}", " + 1".repeat(100))).is_ok());
    }

    #[test]
    fn scripts_split_on_newlines_and_semicolons() {
        let script = "x = 1; y += x * 2\n# comment\n\nprint(x,\n y)";
        let statements = parse_script(script).unwrap();
        assert_eq!(statements.len(), 3);
        assert!(matches!(&statements[0], Statement::Assign { name, op: AssignOp::Set, .. } if name == "x"));
        assert!(matches!(&statements[1], Statement::Assign { op: AssignOp::Add, .. }));
        assert!(matches!(&statements[2], Statement::Expr(Expr::Call { args, .. }) if args.len() == 2));
    }

    #[test]
    fn comparison_is_not_assignment() {
        let statements = parse_script("x == 1").unwrap();
        assert!(matches!(&statements[0], Statement::Expr(Expr::Binary { op: BinaryOp::Eq, .. })));
    }
}
