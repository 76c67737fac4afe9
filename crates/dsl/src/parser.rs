//! Parser for the Boogie pipeline language
//!
//! Consumes a token sequence in a single pass and builds an [`Ast`]. The
//! parser keeps a stack of open closures; `current` is the node new
//! statements attach to. When a closure that belongs to a join (or match)
//! closes, `current` returns to the join itself so sibling branches attach to
//! it. The join ends at the first token that does not open another branch.
//!
//! ```text
//! Program   := "out" "<=" Closure "<=" "in"
//! Closure   := "(" Statement* ")"
//! Statement := Join | Match | Operation
//! Join      := "join" "<=" Closure Closure*
//! Match     := "match" "<=" Guard Closure (Guard Closure)*
//! Operation := Name [Behavior] Literal* "=>" Outcome ("|" Outcome)*
//! ```

use crate::ast::{Ast, Guard, NodeId, NodeKind, Operation};
use crate::error::SyntaxError;
use crate::lexer::{Token, TokenKind};

type ParseResult<T> = std::result::Result<T, SyntaxError>;

/// Parser for the Boogie pipeline language
pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
    ast: Ast,
    stack: Vec<NodeId>,
    current: NodeId,
    /// Guard read inside a match, waiting for its closure
    pending_guard: Option<Guard>,
}

impl Parser {
    /// Create a parser over a token sequence; comments are dropped
    pub fn new(tokens: impl IntoIterator<Item = Token>) -> Self {
        let ast = Ast::new();
        let root = ast.root();
        Self {
            tokens: tokens
                .into_iter()
                .filter(|t| t.kind != TokenKind::Comment)
                .collect(),
            position: 0,
            ast,
            stack: Vec::new(),
            current: root,
            pending_guard: None,
        }
    }

    /// Parse the whole program
    pub fn parse(mut self) -> ParseResult<Ast> {
        self.expect_kind(TokenKind::Out, "'out' at start of program")?;
        self.expect_kind(TokenKind::Outflow, "'<=' after 'out'")?;

        let open = self.expect_delimiter('(', "'(' opening the program body")?;
        let root = self.ast.root();
        self.open_closure(root, &open);

        while !self.stack.is_empty() {
            let Some(token) = self.advance() else {
                return Err(SyntaxError::UnclosedClosure {
                    open: self.stack.len(),
                });
            };
            self.step(token)?;
        }

        match self.advance() {
            Some(token) if token.is_delimiter(')') => {
                return Err(SyntaxError::UnbalancedClose {
                    line: token.line,
                    column: token.column,
                });
            }
            Some(token) if token.kind == TokenKind::Outflow => {}
            Some(token) => return Err(unexpected("'<=' before 'in'", &token)),
            None => {
                return Err(SyntaxError::UnexpectedEof {
                    expected: "'<= in' at end of program".to_string(),
                })
            }
        }
        self.expect_kind(TokenKind::In, "'in' at end of program")?;

        if self.position < self.tokens.len() {
            tracing::debug!(
                "ignoring {} token(s) after end of program",
                self.tokens.len() - self.position
            );
        }

        Ok(self.ast)
    }

    /// Dispatch one token against the node that is currently open
    fn step(&mut self, token: Token) -> ParseResult<()> {
        match self.ast.kind(self.current) {
            Some(NodeKind::Join) => self.step_join(token),
            Some(NodeKind::Match { .. }) => self.step_match(token),
            _ => self.step_closure(token),
        }
    }

    fn step_join(&mut self, token: Token) -> ParseResult<()> {
        if token.is_delimiter('(') {
            let join = self.current;
            self.open_closure(join, &token);
            return Ok(());
        }

        let join = self.current;
        if self.ast.children(join).is_empty() {
            return Err(self.empty_construct(join));
        }
        self.close_construct();
        self.step_closure(token)
    }

    fn step_match(&mut self, token: Token) -> ParseResult<()> {
        let arm = self.current;

        if self.pending_guard.is_some() {
            if !token.is_delimiter('(') {
                return Err(unexpected("'(' after match guard", &token));
            }
            if let Some(guard) = self.pending_guard.take() {
                if let Some(node) = self.ast.get_mut(arm) {
                    if let NodeKind::Match { guards } = &mut node.kind {
                        guards.push(guard);
                    }
                }
            }
            self.open_closure(arm, &token);
            return Ok(());
        }

        if let Some(guard) = guard_for(&token) {
            if self.peek().is_some_and(|t| t.is_delimiter('(')) {
                self.pending_guard = Some(guard);
                return Ok(());
            }
        }

        if self.ast.children(arm).is_empty() {
            return Err(self.empty_construct(arm));
        }
        self.close_construct();
        self.step_closure(token)
    }

    fn step_closure(&mut self, token: Token) -> ParseResult<()> {
        match token.kind {
            TokenKind::Delimiter if token.is_delimiter(')') => self.close_closure(&token),
            TokenKind::Keyword if token.text == "join" => {
                self.expect_kind(TokenKind::Outflow, "'<=' after 'join'")?;
                self.current =
                    self.ast
                        .add_child(self.current, NodeKind::Join, token.line, token.column);
                Ok(())
            }
            TokenKind::Keyword
                if token.text == "match"
                    && self.peek().is_some_and(|t| t.kind == TokenKind::Outflow) =>
            {
                self.advance();
                self.current = self.ast.add_child(
                    self.current,
                    NodeKind::Match { guards: Vec::new() },
                    token.line,
                    token.column,
                );
                Ok(())
            }
            TokenKind::Identifier | TokenKind::Keyword => self.parse_operation(token),
            _ => Err(unexpected("an operation, 'join', 'match' or ')'", &token)),
        }
    }

    /// `Name [Behavior] Literal* "=>" Outcome ("|" Outcome)*`
    fn parse_operation(&mut self, name: Token) -> ParseResult<()> {
        let mut operation = Operation::new(name.text.clone());

        if self.peek().is_some_and(|t| t.kind == TokenKind::Behavior) {
            operation.behavior = self.advance().map(|t| t.text);
        }

        while self.peek().is_some_and(|t| t.kind == TokenKind::Literal) {
            if let Some(literal) = self.advance() {
                operation.push_argument(&literal.text);
            }
        }

        match self.advance() {
            Some(t) if t.kind == TokenKind::Inflow => {}
            Some(t) => {
                return Err(unexpected(
                    &format!("'=>' after operation '{}'", name.text),
                    &t,
                ))
            }
            None => {
                return Err(SyntaxError::UnexpectedEof {
                    expected: format!("'=>' after operation '{}'", name.text),
                })
            }
        }

        let node = self.ast.add_child(
            self.current,
            NodeKind::Operation(operation),
            name.line,
            name.column,
        );

        loop {
            match self.peek() {
                Some(t) if is_outcome(t) => {}
                _ => {
                    return Err(SyntaxError::MissingOutcome {
                        name: name.text,
                        line: name.line,
                        column: name.column,
                    })
                }
            }
            if let Some(outcome) = self.advance() {
                self.ast.add_child(
                    node,
                    NodeKind::Outcome(outcome.text),
                    outcome.line,
                    outcome.column,
                );
            }

            if self.peek().is_some_and(|t| t.is_delimiter('|')) {
                self.advance();
            } else {
                return Ok(());
            }
        }
    }

    fn open_closure(&mut self, parent: NodeId, token: &Token) {
        let closure = self
            .ast
            .add_child(parent, NodeKind::Closure, token.line, token.column);
        self.stack.push(closure);
        self.current = closure;
    }

    /// Pop the innermost closure; a join or match parent becomes current again
    fn close_closure(&mut self, token: &Token) -> ParseResult<()> {
        let closure = self.stack.pop().ok_or(SyntaxError::UnbalancedClose {
            line: token.line,
            column: token.column,
        })?;
        self.current = self.ast.parent(closure).unwrap_or_else(|| self.ast.root());
        Ok(())
    }

    /// Leave a finished join or match, returning to the enclosing closure
    fn close_construct(&mut self) {
        self.current = self
            .stack
            .last()
            .copied()
            .unwrap_or_else(|| self.ast.root());
    }

    fn empty_construct(&self, id: NodeId) -> SyntaxError {
        let (line, column) = self
            .ast
            .get(id)
            .map(|n| (n.line, n.column))
            .unwrap_or((0, 0));
        match self.ast.kind(id) {
            Some(NodeKind::Match { .. }) => SyntaxError::EmptyMatch { line, column },
            _ => SyntaxError::EmptyJoin { line, column },
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn expect_kind(&mut self, kind: TokenKind, expected: &str) -> ParseResult<Token> {
        match self.advance() {
            Some(token) if token.kind == kind => Ok(token),
            Some(token) => Err(unexpected(expected, &token)),
            None => Err(SyntaxError::UnexpectedEof {
                expected: expected.to_string(),
            }),
        }
    }

    fn expect_delimiter(&mut self, delimiter: char, expected: &str) -> ParseResult<Token> {
        match self.advance() {
            Some(token) if token.is_delimiter(delimiter) => Ok(token),
            Some(token) => Err(unexpected(expected, &token)),
            None => Err(SyntaxError::UnexpectedEof {
                expected: expected.to_string(),
            }),
        }
    }
}

fn unexpected(expected: &str, found: &Token) -> SyntaxError {
    SyntaxError::Unexpected {
        expected: expected.to_string(),
        found: found.describe(),
        line: found.line,
        column: found.column,
    }
}

fn is_outcome(token: &Token) -> bool {
    match token.kind {
        TokenKind::Identifier => true,
        TokenKind::Keyword => token.text != "join",
        _ => false,
    }
}

fn guard_for(token: &Token) -> Option<Guard> {
    match token.kind {
        TokenKind::Keyword if token.text == "default" => Some(Guard::Default),
        TokenKind::Keyword if token.text == "ok" => Some(Guard::Ok),
        TokenKind::Literal => Some(Guard::Equals(token.text.clone())),
        TokenKind::Identifier => Some(Guard::Memory(token.text.clone())),
        _ => None,
    }
}

/// Parse an already-lexed token sequence
pub fn parse(tokens: impl IntoIterator<Item = Token>) -> ParseResult<Ast> {
    Parser::new(tokens).parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse_source(source: &str) -> ParseResult<Ast> {
        parse(tokenize(source).expect("source should lex"))
    }

    fn kind_names(ast: &Ast, ids: &[NodeId]) -> Vec<&'static str> {
        ids.iter()
            .map(|id| ast.kind(*id).map(|k| k.name()).unwrap_or("?"))
            .collect()
    }

    fn operation_name(ast: &Ast, id: NodeId) -> String {
        match ast.kind(id) {
            Some(NodeKind::Operation(op)) => op.name.clone(),
            other => panic!("expected operation, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_program() {
        let ast = parse_source("out <= () <= in").unwrap();
        let root_children = ast.children(ast.root());
        assert_eq!(kind_names(&ast, root_children), vec!["closure"]);
        assert!(ast.children(root_children[0]).is_empty());
    }

    #[test]
    fn test_single_operation() {
        let ast = parse_source("out <= (analyze => send) <= in").unwrap();
        let closure = ast.children(ast.root())[0];
        let statements = ast.children(closure);
        assert_eq!(statements.len(), 1);
        assert_eq!(operation_name(&ast, statements[0]), "analyze");

        let outcomes = ast.children(statements[0]);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(
            ast.kind(outcomes[0]),
            Some(&NodeKind::Outcome("send".to_string()))
        );
    }

    #[test]
    fn test_behavior_parameters_and_outcomes() {
        let ast =
            parse_source(r#"out <= (call<browser> "quantum" "limit=5" => send | back) <= in"#)
                .unwrap();
        let closure = ast.children(ast.root())[0];
        let op = ast.children(closure)[0];

        let Some(NodeKind::Operation(operation)) = ast.kind(op) else {
            panic!("expected operation");
        };
        assert_eq!(operation.name, "call");
        assert_eq!(operation.behavior.as_deref(), Some("browser"));
        assert_eq!(operation.parameters.get("arg0").map(String::as_str), Some("quantum"));
        assert_eq!(operation.parameters.get("limit").map(String::as_str), Some("5"));
        assert_eq!(ast.children(op).len(), 2);
    }

    #[test]
    fn test_join_branches_attach_to_join() {
        let source = r#"
            out <= (
                join <= (
                    analyze => next
                    verify  => send
                ) (
                    analyze => next
                    verify  => send
                )
            ) <= in"#;
        let ast = parse_source(source).unwrap();

        let outer = ast.children(ast.root())[0];
        assert_eq!(kind_names(&ast, ast.children(outer)), vec!["join"]);

        let join = ast.children(outer)[0];
        let branches = ast.children(join);
        assert_eq!(kind_names(&ast, branches), vec!["closure", "closure"]);
        for branch in branches {
            assert_eq!(ast.children(*branch).len(), 2);
            assert_eq!(ast.parent(*branch), Some(join));
        }
    }

    #[test]
    fn test_statement_after_join_attaches_to_enclosing_closure() {
        let source = "out <= (join <= (analyze => ok) (reason => ok) verify => send) <= in";
        let ast = parse_source(source).unwrap();

        let outer = ast.children(ast.root())[0];
        let statements = ast.children(outer);
        assert_eq!(kind_names(&ast, statements), vec!["join", "operation"]);
        assert_eq!(operation_name(&ast, statements[1]), "verify");
    }

    #[test]
    fn test_nested_join() {
        let source = "out <= (join <= (join <= (a => ok) (b => ok)) (c => ok)) <= in";
        let ast = parse_source(source).unwrap();

        let outer = ast.children(ast.root())[0];
        let join = ast.children(outer)[0];
        let first_branch = ast.children(join)[0];
        assert_eq!(kind_names(&ast, ast.children(first_branch)), vec!["join"]);
        assert_eq!(ast.children(join).len(), 2);
    }

    #[test]
    fn test_match_arms() {
        let source = r#"out <= (
            verify => ok
            match <= "approved" (send => ok) default (cancel => ok)
            next => ok
        ) <= in"#;
        let ast = parse_source(source).unwrap();

        let outer = ast.children(ast.root())[0];
        let statements = ast.children(outer);
        assert_eq!(kind_names(&ast, statements), vec!["operation", "match", "operation"]);

        let Some(NodeKind::Match { guards }) = ast.kind(statements[1]) else {
            panic!("expected match");
        };
        assert_eq!(
            guards,
            &vec![Guard::Equals("approved".to_string()), Guard::Default]
        );
        assert_eq!(ast.children(statements[1]).len(), 2);
    }

    #[test]
    fn test_match_without_outflow_is_an_operation() {
        let ast = parse_source("out <= (match => ok) <= in").unwrap();
        let outer = ast.children(ast.root())[0];
        assert_eq!(operation_name(&ast, ast.children(outer)[0]), "match");
    }

    #[test]
    fn test_comments_are_ignored() {
        let source = "out <= ( ; plan\n analyze => next ; then go\n) <= in ; done";
        let ast = parse_source(source).unwrap();
        let outer = ast.children(ast.root())[0];
        assert_eq!(ast.children(outer).len(), 1);
    }

    #[test]
    fn test_trailing_tokens_ignored() {
        assert!(parse_source("out <= () <= in analyze => next").is_ok());
    }

    #[test]
    fn test_missing_out() {
        let err = parse_source("(analyze => next) <= in").unwrap_err();
        assert!(matches!(err, SyntaxError::Unexpected { line: 1, column: 1, .. }));
    }

    #[test]
    fn test_missing_in() {
        assert!(matches!(
            parse_source("out <= (analyze => next)").unwrap_err(),
            SyntaxError::UnexpectedEof { .. }
        ));
        assert!(matches!(
            parse_source("out <= (analyze => next) <= out").unwrap_err(),
            SyntaxError::Unexpected { .. }
        ));
    }

    #[test]
    fn test_missing_inflow() {
        let err = parse_source("out <= (analyze next) <= in").unwrap_err();
        assert!(matches!(err, SyntaxError::Unexpected { ref expected, .. } if expected.contains("'=>'")));
    }

    #[test]
    fn test_missing_outcome() {
        let err = parse_source("out <= (analyze => ) <= in").unwrap_err();
        assert!(matches!(err, SyntaxError::MissingOutcome { ref name, .. } if name == "analyze"));
    }

    #[test]
    fn test_unbalanced_parentheses() {
        assert!(matches!(
            parse_source("out <= (analyze => next <= in").unwrap_err(),
            SyntaxError::Unexpected { .. } | SyntaxError::UnclosedClosure { .. }
        ));
        assert!(matches!(
            parse_source("out <= (analyze => next)) <= in").unwrap_err(),
            SyntaxError::UnbalancedClose { .. }
        ));
        assert!(matches!(
            parse_source("out <= (join <= (analyze => next)").unwrap_err(),
            SyntaxError::UnclosedClosure { open: 1 }
        ));
    }

    #[test]
    fn test_join_without_branches() {
        let err = parse_source("out <= (join <= analyze => next) <= in").unwrap_err();
        assert!(matches!(err, SyntaxError::EmptyJoin { line: 1, column: 9 }));
    }

    #[test]
    fn test_bare_nested_closure_rejected() {
        assert!(parse_source("out <= ((analyze => next)) <= in").is_err());
    }
}
