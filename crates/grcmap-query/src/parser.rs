//! Filter-expression parser
//!
//! Grammar (keywords are case-insensitive):
//!
//! ```text
//! query      := or_expr? order_by?
//! or_expr    := and_expr ("OR" or_expr)?
//! and_expr   := unary ("AND" and_expr)?
//! unary      := "NOT" unary | primary
//! primary    := "(" or_expr ")" | relevant | comparison | text_search
//! relevant   := "#" name "," id ("," id)* "#"
//! comparison := operand op operand
//! operand    := '"' chars '"' | bare-word
//! order_by   := "ORDER" "BY" key ("ASC" | "DESC")? ("," key ...)*
//! ```
//!
//! Boolean chains nest to the right: `a AND b AND c` is `a AND (b AND c)`.

use crate::expr::{BoolOp, ComparisonOp, Expression, FilterQuery, OrderKey};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while1},
    character::complete::{char as pchar, multispace0, multispace1, satisfy},
    combinator::{all_consuming, map, not, opt, peek, verify},
    error::{Error as NomError, ErrorKind},
    multi::separated_list1,
    sequence::{delimited, preceded, terminated, tuple},
    IResult,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("filter parse error at offset {position}: {message}")]
pub struct QueryParseError {
    pub position: usize,
    pub message: String,
}

const RESERVED: &str = "()\"#=!~<>,";
const KEYWORDS: [&str; 4] = ["AND", "OR", "NOT", "ORDER"];

/// Parse filter text into a [`FilterQuery`]. Blank input is the empty filter.
pub fn parse(text: &str) -> Result<FilterQuery, QueryParseError> {
    if text.trim().is_empty() {
        return Ok(FilterQuery::default());
    }

    let result = all_consuming(delimited(
        multispace0,
        alt((
            map(order_by, |keys| (Expression::Empty, keys)),
            map(
                tuple((or_expr, opt(preceded(multispace1, order_by)))),
                |(expr, keys)| (expr, keys.unwrap_or_default()),
            ),
        )),
        multispace0,
    ))(text);

    match result {
        Ok((_, (expression, order_by))) => Ok(FilterQuery::new(expression).with_order_by(order_by)),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(QueryParseError {
            position: text.len() - e.input.len(),
            message: describe(e.input),
        }),
        Err(nom::Err::Incomplete(_)) => Err(QueryParseError {
            position: text.len(),
            message: "unexpected end of input".to_string(),
        }),
    }
}

fn describe(remaining: &str) -> String {
    let snippet: String = remaining.chars().take(16).collect();
    if snippet.is_empty() {
        "unexpected end of input".to_string()
    } else {
        format!("unexpected input near `{snippet}`")
    }
}

// ============================================================================
// Boolean structure
// ============================================================================

fn or_expr(input: &str) -> IResult<&str, Expression> {
    let (input, left) = and_expr(input)?;
    let (input, right) = opt(preceded(
        delimited(multispace0, keyword("OR"), multispace0),
        or_expr,
    ))(input)?;
    Ok((
        input,
        match right {
            Some(right) => Expression::binary(left, BoolOp::Or, right),
            None => left,
        },
    ))
}

fn and_expr(input: &str) -> IResult<&str, Expression> {
    let (input, left) = unary(input)?;
    let (input, right) = opt(preceded(
        delimited(multispace0, keyword("AND"), multispace0),
        and_expr,
    ))(input)?;
    Ok((
        input,
        match right {
            Some(right) => Expression::binary(left, BoolOp::And, right),
            None => left,
        },
    ))
}

fn unary(input: &str) -> IResult<&str, Expression> {
    alt((
        map(
            preceded(terminated(keyword("NOT"), multispace0), unary),
            |inner| Expression::Not(Box::new(inner)),
        ),
        primary,
    ))(input)
}

fn primary(input: &str) -> IResult<&str, Expression> {
    alt((
        delimited(
            terminated(pchar('('), multispace0),
            or_expr,
            preceded(multispace0, pchar(')')),
        ),
        relevant,
        comparison,
        map(operand, Expression::TextSearch),
    ))(input)
}

// ============================================================================
// Leaves
// ============================================================================

fn relevant(input: &str) -> IResult<&str, Expression> {
    let (input, _) = pchar('#')(input)?;
    let (input, object_name) = take_while1(is_ident_char)(input)?;
    let (input, _) = pchar(',')(input)?;
    let (input, ids) = separated_list1(pchar(','), take_while1(is_id_char))(input)?;
    let (input, _) = pchar('#')(input)?;
    Ok((input, Expression::relevant(object_name, ids)))
}

fn comparison(input: &str) -> IResult<&str, Expression> {
    let (input, (left, _, op, _, right)) =
        tuple((operand, multispace0, comparison_op, multispace0, operand))(input)?;
    Ok((input, Expression::Comparison { left, op, right }))
}

fn comparison_op(input: &str) -> IResult<&str, ComparisonOp> {
    // Two-character operators first so `!=` never parses as `!` + `=`.
    let (rest, symbol) = alt((
        tag("!~"),
        tag("!="),
        tag("<="),
        tag(">="),
        tag("="),
        tag("~"),
        tag("<"),
        tag(">"),
    ))(input)?;
    match ComparisonOp::from_symbol(symbol) {
        Some(op) => Ok((rest, op)),
        None => Err(nom::Err::Error(NomError::new(input, ErrorKind::Tag))),
    }
}

fn operand(input: &str) -> IResult<&str, String> {
    alt((quoted, map(bare_word, str::to_string)))(input)
}

fn bare_word(input: &str) -> IResult<&str, &str> {
    verify(
        take_while1(|c: char| !c.is_whitespace() && !RESERVED.contains(c)),
        |word: &str| !KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word)),
    )(input)
}

fn quoted(input: &str) -> IResult<&str, String> {
    let (body, _) = pchar('"')(input)?;
    let mut out = String::new();
    let mut chars = body.char_indices();
    while let Some((idx, ch)) = chars.next() {
        match ch {
            '"' => return Ok((&body[idx + 1..], out)),
            '\\' => match chars.next() {
                Some((_, escaped)) => out.push(escaped),
                None => break,
            },
            other => out.push(other),
        }
    }
    Err(nom::Err::Error(NomError::new(input, ErrorKind::Char)))
}

// ============================================================================
// Ordering
// ============================================================================

fn order_by(input: &str) -> IResult<&str, Vec<OrderKey>> {
    let (input, _) = tuple((keyword("ORDER"), multispace1, keyword("BY"), multispace1))(input)?;
    separated_list1(delimited(multispace0, pchar(','), multispace0), order_key)(input)
}

fn order_key(input: &str) -> IResult<&str, OrderKey> {
    let (input, name) = operand(input)?;
    let (input, direction) = opt(preceded(
        multispace1,
        alt((keyword("ASC"), keyword("DESC"))),
    ))(input)?;
    let desc = direction.is_some_and(|d| d.eq_ignore_ascii_case("DESC"));
    Ok((input, OrderKey { name, desc }))
}

// ============================================================================
// Helpers
// ============================================================================

/// Case-insensitive keyword that must end at a word boundary.
fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(
        tag_no_case(kw),
        not(peek(satisfy(|c: char| c.is_alphanumeric() || c == '_'))),
    )
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}
