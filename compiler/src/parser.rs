// Parser for kfuse .kfs schedule files.
//
// Parses the token stream from the lexer into an AST using chumsky
// combinators. Statements are newline separated; stage bodies use the usual
// precedence (unary minus, then `* /`, then `+ -`, all left associative).
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns an AST plus any parse errors (non-fatal).
// Failure modes: syntax errors produce `Rich` diagnostics.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::lexer::Token;

/// Result of parsing: AST plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub program: Option<Program>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse a .kfs source string. Lexes then parses.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = program_parser(source);
    let (program, parse_errors) = parser.parse(stream).into_output_errors();

    // Lex errors first, then parse errors.
    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lex_result
        .errors
        .into_iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message)
        })
        .collect();
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));

    ParseResult {
        program,
        errors: all_errors,
    }
}

// ── Main parser builder ──
//
// All grammar rules are built inside `program_parser` so that the `source`
// reference is captured once and shared by all combinators.

fn program_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, Program, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    let nl = just(Token::Newline).repeated().ignored();

    // ── Identifier ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: source[span.start()..span.end()].to_string(),
            span,
        }
    });

    let number = select! { Token::Number(n) => n };

    let signed = just(Token::Minus)
        .or_not()
        .then(number.clone())
        .map(|(neg, n)| if neg.is_some() { -n } else { n });

    // ── Expressions ──

    let expr = recursive(|expr| {
        let args = expr
            .clone()
            .separated_by(just(Token::Comma))
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LParen), just(Token::RParen));

        let ident_or_call = ident.clone().then(args.or_not()).map_with(|(name, args), e| {
            let kind = match args {
                Some(args) => ExprKind::Call(name, args),
                None => ExprKind::Ident(name),
            };
            Expr {
                kind,
                span: e.span(),
            }
        });

        let literal = number.clone().map_with(|n, e| Expr {
            kind: ExprKind::Number(n),
            span: e.span(),
        });

        let atom = literal
            .or(ident_or_call)
            .or(expr.delimited_by(just(Token::LParen), just(Token::RParen)));

        let unary = just(Token::Minus)
            .repeated()
            .foldr_with(atom, |_, rhs: Expr, e| Expr {
                kind: ExprKind::Neg(Box::new(rhs)),
                span: e.span(),
            });

        let product_op = just(Token::Star)
            .to(BinOp::Mul)
            .or(just(Token::Slash).to(BinOp::Div));
        let product = unary.clone().foldl_with(
            product_op.then(unary).repeated(),
            |lhs, (op, rhs), e| Expr {
                kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
                span: e.span(),
            },
        );

        let sum_op = just(Token::Plus)
            .to(BinOp::Add)
            .or(just(Token::Minus).to(BinOp::Sub));
        product.clone().foldl_with(
            sum_op.then(product).repeated(),
            |lhs, (op, rhs), e| Expr {
                kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
                span: e.span(),
            },
        )
    });

    // ── Dimension value lists: tile(x: 16, y: 8) ──

    let dim_value = ident
        .clone()
        .then_ignore(just(Token::Colon))
        .then(number.clone())
        .map_with(|(dim, value), e| DimValue {
            dim,
            value,
            span: e.span(),
        });

    let dim_values = dim_value
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LParen), just(Token::RParen));

    let tile_list = just(Token::Tile).ignore_then(dim_values.clone());
    let threads_list = just(Token::Threads).ignore_then(dim_values);

    // ── Statements ──

    let set_value = select! {
        Token::Number(n) = e => SetValue::Number(n, e.span()),
        Token::Size(s) = e => SetValue::Size(s, e.span()),
    }
    .or(ident.clone().map(SetValue::Ident));

    let set_stmt = just(Token::Set)
        .ignore_then(ident.clone())
        .then_ignore(just(Token::Equals))
        .then(set_value)
        .map(|(name, value)| StatementKind::Set(SetStmt { name, value }));

    let param_stmt = just(Token::Param)
        .ignore_then(ident.clone())
        .then(
            just(Token::Equals)
                .ignore_then(number.map_with(|n, e| (n, e.span())))
                .or_not(),
        )
        .map(|(name, default)| StatementKind::Param(ParamStmt { name, default }));

    let stage_stmt = just(Token::Stage)
        .ignore_then(ident.clone())
        .then(
            ident
                .clone()
                .separated_by(just(Token::Comma))
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .then(just(Token::Colon).ignore_then(ident.clone()).or_not())
        .then_ignore(just(Token::Equals))
        .then(expr)
        .map(|(((name, dims), elem), body)| {
            StatementKind::Stage(StageStmt {
                name,
                dims,
                elem,
                body,
            })
        });

    let extent = select! {
        Token::Number(n) = e => Extent::Number(n, e.span()),
    }
    .or(ident.clone().map(Extent::Param));

    let output_stmt = just(Token::Output)
        .ignore_then(ident.clone())
        .then(
            extent
                .separated_by(just(Token::Comma))
                .at_least(1)
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LBracket), just(Token::RBracket)),
        )
        .then(tile_list.clone().or_not())
        .then(threads_list.clone().or_not())
        .map(|(((name, extents), tile), threads)| {
            StatementKind::Output(OutputStmt {
                name,
                extents,
                tile: tile.unwrap_or_default(),
                threads: threads.unwrap_or_default(),
            })
        });

    let root_placement = just(Token::Root)
        .ignore_then(tile_list.or_not())
        .then(threads_list.clone().or_not())
        .map(|(tile, threads)| PlacementSpec::Root {
            tile: tile.unwrap_or_default(),
            threads: threads.unwrap_or_default(),
        });

    let level = just(Token::Block)
        .ignore_then(threads_list.or_not())
        .map(|threads| (Level::Block, threads.unwrap_or_default()))
        .or(just(Token::Thread).to((Level::Thread, Vec::new())));

    let anchored_placement = just(Token::At)
        .ignore_then(ident.clone())
        .then(level)
        .map(|(anchor, (level, threads))| PlacementSpec::At {
            anchor,
            level,
            threads,
        });

    let compute_stmt = just(Token::Compute)
        .ignore_then(ident.clone())
        .then(root_placement.or(anchored_placement))
        .map(|(name, placement)| StatementKind::Compute(ComputeStmt { name, placement }));

    let bound_stmt = just(Token::Bound)
        .ignore_then(ident.clone())
        .then(ident.clone())
        .then(
            signed
                .clone()
                .then_ignore(just(Token::Comma))
                .then(signed)
                .delimited_by(just(Token::LBracket), just(Token::RBracket)),
        )
        .map(|((stage, dim), (lo, hi))| StatementKind::Bound(BoundStmt { stage, dim, lo, hi }));

    // ── Statement dispatch ──

    let statement = choice((
        set_stmt,
        param_stmt,
        stage_stmt,
        output_stmt,
        compute_stmt,
        bound_stmt,
    ))
    .map_with(|kind, e| Statement {
        kind,
        span: e.span(),
    });

    // ── Program ──

    nl.clone()
        .ignore_then(
            statement
                .separated_by(just(Token::Newline).repeated().at_least(1))
                .allow_trailing()
                .collect::<Vec<_>>(),
        )
        .then_ignore(nl)
        .map_with(move |statements, e| Program {
            statements,
            span: e.span(),
        })
}

// ── Tests ──
