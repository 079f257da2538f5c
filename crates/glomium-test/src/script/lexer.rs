//! Tokenizer.

use std::iter::Peekable;
use std::str::CharIndices;

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Undefined,
    Fn,
    Throw,
    Loop,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Semi,
    Colon,
    Dot,
    Assign,
    Eq,
    Arrow,
    Plus,
    Minus,
    Star,
}

/// Split `source` into tokens.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let mut chars = source.char_indices().peekable();
    let mut tokens = Vec::new();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let token = match c {
            '0'..='9' => number(&mut chars, source, start)?,
            '"' | '\'' => string(&mut chars, c)?,
            c if c.is_alphabetic() || c == '_' || c == '$' => word(&mut chars, source, start),
            _ => {
                chars.next();
                punct(&mut chars, c, start)?
            },
        };
        tokens.push(token);
    }
    Ok(tokens)
}

fn number(chars: &mut Peekable<CharIndices<'_>>, source: &str, start: usize) -> Result<Token, String> {
    let mut end = start;
    while let Some(&(i, c)) = chars.peek() {
        let fraction = c == '.'
            && source
                .get(i.saturating_add(1)..)
                .and_then(|rest| rest.chars().next())
                .is_some_and(|d| d.is_ascii_digit());
        if c.is_ascii_digit() || fraction {
            end = i.saturating_add(c.len_utf8());
            chars.next();
        } else {
            break;
        }
    }
    let text = &source[start..end];
    text.parse()
        .map(Token::Number)
        .map_err(|_| format!("invalid number '{text}'"))
}

fn string(chars: &mut Peekable<CharIndices<'_>>, quote: char) -> Result<Token, String> {
    chars.next();
    let mut out = String::new();
    while let Some((_, c)) = chars.next() {
        match c {
            c if c == quote => return Ok(Token::Str(out)),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, other)) => out.push(other),
                None => break,
            },
            c => out.push(c),
        }
    }
    Err("unterminated string".to_owned())
}

fn word(chars: &mut Peekable<CharIndices<'_>>, source: &str, start: usize) -> Token {
    let mut end = start;
    while let Some(&(i, c)) = chars.peek() {
        if c.is_alphanumeric() || c == '_' || c == '$' {
            end = i.saturating_add(c.len_utf8());
            chars.next();
        } else {
            break;
        }
    }
    match &source[start..end] {
        "true" => Token::True,
        "false" => Token::False,
        "null" => Token::Null,
        "undefined" => Token::Undefined,
        "fn" => Token::Fn,
        "throw" => Token::Throw,
        "loop" => Token::Loop,
        ident => Token::Ident(ident.to_owned()),
    }
}

fn punct(chars: &mut Peekable<CharIndices<'_>>, c: char, at: usize) -> Result<Token, String> {
    let token = match c {
        '(' => Token::LParen,
        ')' => Token::RParen,
        '[' => Token::LBracket,
        ']' => Token::RBracket,
        '{' => Token::LBrace,
        '}' => Token::RBrace,
        ',' => Token::Comma,
        ';' => Token::Semi,
        ':' => Token::Colon,
        '.' => Token::Dot,
        '+' => Token::Plus,
        '-' => Token::Minus,
        '*' => Token::Star,
        '=' => match chars.peek() {
            Some(&(_, '=')) => {
                chars.next();
                Token::Eq
            },
            Some(&(_, '>')) => {
                chars.next();
                Token::Arrow
            },
            _ => Token::Assign,
        },
        other => return Err(format!("unexpected character '{other}' at {at}")),
    };
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_expressions() {
        let tokens = tokenize("x = fn(a) => a == 'q\\'s' ; 2.5").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("x".into()),
                Token::Assign,
                Token::Fn,
                Token::LParen,
                Token::Ident("a".into()),
                Token::RParen,
                Token::Arrow,
                Token::Ident("a".into()),
                Token::Eq,
                Token::Str("q's".into()),
                Token::Semi,
                Token::Number(2.5),
            ]
        );
    }

    #[test]
    fn dot_after_number_is_member_access() {
        assert_eq!(
            tokenize("a[0].b").unwrap()[3..],
            [Token::RBracket, Token::Dot, Token::Ident("b".into())]
        );
    }

    #[test]
    fn reports_bad_input() {
        assert!(tokenize("\"open").is_err());
        assert!(tokenize("a # b").is_err());
    }
}
