//! Hand-written lexer. No external tokenizer crate: the front end is kept
//! dependency-free, same as the rest of this layer.

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    IntLit(String),
    FloatLit(String),
    StringLit(String),
    Symbol(&'static str),
    Eof,
}

#[derive(Debug, Clone)]
pub struct Lexeme {
    pub token: Token,
    pub line: u32,
}

const SYMBOLS_3: &[&str] = &["..."];
const SYMBOLS_2: &[&str] = &[
    ":=", "==", "!=", "<=", ">=", "<<", ">>", "&&", "||", "^^",
];
const SYMBOLS_1: &[char] = &[
    '(', ')', '[', ']', '{', '}', ',', ';', ':', '.', '+', '-', '*', '/', '%', '<', '>', '=',
    '&', '|', '^', '~', '!', '#', '@',
];

pub fn tokenize(src: &str) -> Vec<Lexeme> {
    let bytes: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    let mut line = 1u32;

    while i < bytes.len() {
        let c = bytes[i];

        if c == '\n' {
            line += 1;
            i += 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '#' {
            while i < bytes.len() && bytes[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && bytes.get(i + 1) == Some(&'/') {
            while i < bytes.len() && bytes[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && bytes.get(i + 1) == Some(&'*') {
            i += 2;
            while i + 1 < bytes.len() && !(bytes[i] == '*' && bytes[i + 1] == '/') {
                if bytes[i] == '\n' {
                    line += 1;
                }
                i += 1;
            }
            i = (i + 2).min(bytes.len());
            continue;
        }

        if c == '"' {
            let start_line = line;
            i += 1;
            let mut s = String::new();
            while i < bytes.len() && bytes[i] != '"' {
                if bytes[i] == '\\' && i + 1 < bytes.len() {
                    let esc = bytes[i + 1];
                    s.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        '0' => '\0',
                        other => other,
                    });
                    i += 2;
                } else {
                    if bytes[i] == '\n' {
                        line += 1;
                    }
                    s.push(bytes[i]);
                    i += 1;
                }
            }
            i += 1; // closing quote
            out.push(Lexeme {
                token: Token::StringLit(s),
                line: start_line,
            });
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            let mut is_float = false;
            if c == '0' && matches!(bytes.get(i + 1), Some('x') | Some('X')) {
                i += 2;
                while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
                    i += 1;
                }
            } else if c == '0' && matches!(bytes.get(i + 1), Some('b') | Some('B')) {
                i += 2;
                while i < bytes.len() && matches!(bytes[i], '0' | '1') {
                    i += 1;
                }
            } else {
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if bytes.get(i) == Some(&'.') && bytes.get(i + 1).is_some_and(|d| d.is_ascii_digit()) {
                    is_float = true;
                    i += 1;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = bytes[start..i].iter().collect();
            out.push(Lexeme {
                token: if is_float {
                    Token::FloatLit(text)
                } else {
                    Token::IntLit(text)
                },
                line,
            });
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_alphanumeric() || bytes[i] == '_' || bytes[i] == '.') {
                // dotted identifiers (struct members, `.range`) are lexed whole;
                // the parser splits on the last segment it cares about.
                if bytes[i] == '.' {
                    let next_is_ident_start = bytes
                        .get(i + 1)
                        .is_some_and(|d| d.is_alphabetic() || *d == '_');
                    if !next_is_ident_start {
                        break;
                    }
                }
                i += 1;
            }
            let text: String = bytes[start..i].iter().collect();
            out.push(Lexeme {
                token: Token::Ident(text),
                line,
            });
            continue;
        }

        if let Some(sym) = SYMBOLS_3.iter().find(|s| matches_at(&bytes, i, s)) {
            out.push(Lexeme {
                token: Token::Symbol(sym),
                line,
            });
            i += sym.len();
            continue;
        }
        if let Some(sym) = SYMBOLS_2.iter().find(|s| matches_at(&bytes, i, s)) {
            out.push(Lexeme {
                token: Token::Symbol(sym),
                line,
            });
            i += sym.len();
            continue;
        }
        if SYMBOLS_1.contains(&c) {
            let sym: &'static str = symbol_str(c);
            out.push(Lexeme {
                token: Token::Symbol(sym),
                line,
            });
            i += 1;
            continue;
        }

        // Unrecognized character: skip it, the parser will trip on the gap
        // with a syntax error at the surrounding tokens' location.
        i += 1;
    }

    out.push(Lexeme {
        token: Token::Eof,
        line,
    });
    out
}

fn matches_at(bytes: &[char], i: usize, sym: &str) -> bool {
    let chars: Vec<char> = sym.chars().collect();
    if i + chars.len() > bytes.len() {
        return false;
    }
    bytes[i..i + chars.len()] == chars[..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Token> {
        tokenize(src).into_iter().map(|l| l.token).collect()
    }

    #[test]
    fn dotted_identifier_is_one_token() {
        assert_eq!(toks("A.x"), vec![Token::Ident("A.x".to_string()), Token::Eof]);
    }

    #[test]
    fn trailing_dot_is_not_swallowed_into_the_identifier() {
        // `A.` where `.` isn't followed by an identifier start: the member
        // access stops and the dot is its own token (e.g. `A . 5` is nonsense,
        // but `dim(a)` callers rely on this boundary for other punctuation).
        assert_eq!(
            toks("A. "),
            vec![Token::Ident("A".to_string()), Token::Symbol("."), Token::Eof]
        );
    }

    #[test]
    fn three_two_and_one_char_symbols_are_disambiguated_by_longest_match() {
        assert_eq!(
            toks("... := == != <= >= << >> && || ^^ <"),
            vec![
                Token::Symbol("..."),
                Token::Symbol(":="),
                Token::Symbol("=="),
                Token::Symbol("!="),
                Token::Symbol("<="),
                Token::Symbol(">="),
                Token::Symbol("<<"),
                Token::Symbol(">>"),
                Token::Symbol("&&"),
                Token::Symbol("||"),
                Token::Symbol("^^"),
                Token::Symbol("<"),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn hex_and_binary_int_literals() {
        assert_eq!(toks("0x1F 0b101 42"), vec![
            Token::IntLit("0x1F".to_string()),
            Token::IntLit("0b101".to_string()),
            Token::IntLit("42".to_string()),
            Token::Eof,
        ]);
    }

    #[test]
    fn float_literal_requires_a_digit_after_the_dot() {
        assert_eq!(toks("3.14"), vec![Token::FloatLit("3.14".to_string()), Token::Eof]);
        // `5.` with nothing after the dot is an int followed by a bare `.`.
        assert_eq!(
            toks("5."),
            vec![Token::IntLit("5".to_string()), Token::Symbol("."), Token::Eof]
        );
    }

    #[test]
    fn string_literal_decodes_backslash_escapes() {
        assert_eq!(
            toks("\"a\\nb\\tc\""),
            vec![Token::StringLit("a\nb\tc".to_string()), Token::Eof]
        );
    }

    #[test]
    fn hash_and_slash_slash_comments_run_to_end_of_line() {
        assert_eq!(
            toks("x := 1; # trailing\ny := 2;\nz := 3; // also trailing"),
            toks("x := 1; \ny := 2;\nz := 3; ")
        );
    }

    #[test]
    fn block_comments_are_skipped_and_track_newlines() {
        let lexemes = tokenize("x := 1; /* spans\na line */ y := 2;");
        let y_line = lexemes
            .iter()
            .find(|l| l.token == Token::Ident("y".to_string()))
            .unwrap()
            .line;
        assert_eq!(y_line, 2);
    }
}

fn symbol_str(c: char) -> &'static str {
    match c {
        '(' => "(",
        ')' => ")",
        '[' => "[",
        ']' => "]",
        '{' => "{",
        '}' => "}",
        ',' => ",",
        ';' => ";",
        ':' => ":",
        '.' => ".",
        '+' => "+",
        '-' => "-",
        '*' => "*",
        '/' => "/",
        '%' => "%",
        '<' => "<",
        '>' => ">",
        '=' => "=",
        '&' => "&",
        '|' => "|",
        '^' => "^",
        '~' => "~",
        '!' => "!",
        '#' => "#",
        '@' => "@",
        _ => unreachable!(),
    }
}
