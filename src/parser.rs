//! Lexer and grammar parser for one input line.
//!
//! Lexing (`tokenize`) turns a line into a flat [`Token`] stream: words
//! (quote-aware, per spec.md §4.2), pipe/sequencing operators, and
//! redirection operators. The fd-numeral-glued-to-arrow rule from spec.md
//! §4.2 ("the numeral and the arrow must be contiguous") is enforced by
//! only recognizing a redirect operator at the *start* of a token — digits
//! appearing mid-word are ordinary word characters.
//!
//! Parsing (`parse_line`) folds that stream into the grammar: `;`/`&&`/`||`
//! split the line into [`ChainEntry`] values (an EXPANSION over spec.md's
//! core pipeline grammar, see SPEC_FULL.md §4.2), each of which wraps one
//! `job := pipeline ('&')?`.

use crate::ast::{Arg, ChainEntry, CommandExp, Connector, JobExp, PipelineExp, RedirectTarget, Word, WordSegment};
use crate::error::ParseError;

/// One lexical unit of an input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Word(Word),
    Pipe,
    PipePipe,
    Amp,
    AmpAmp,
    Semi,
    Redirect(RedirectToken),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedirectToken {
    pub fd: i32,
    pub form: RedirectForm,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RedirectForm {
    /// `N<` — needs a following `Token::Word` filename.
    ReadFilePending,
    /// `N>` — needs a following `Token::Word` filename.
    WriteFilePending,
    /// `N>>` — needs a following `Token::Word` filename.
    AppendFilePending,
    /// `N<<<` — needs a following `Token::Word` literal string.
    HereStringPending,
    /// `N<&M` / `N>&M` — complete on its own, no following word.
    DupFd(i32),
}

// Characters excluded from bare (unquoted, outside-redirect) word text.
// Per spec.md §4.2: `[A-Za-z0-9] ∪ punctuation − {|, &, ", ', <, >}`.
// `;` is additionally excluded here so the chain-sequencing EXPANSION
// (spec.md §4.2 / SPEC_FULL.md §4.2) always splits on a bare `;`, matching
// every POSIX shell's behavior rather than only splitting when `;` happens
// to be its own whitespace-delimited token. See DESIGN.md.
const EXCLUDED_BARE_CHARS: &[char] = &['|', '&', '"', '\'', '<', '>', ';'];

fn is_bare_char(c: char) -> bool {
    (c.is_ascii_alphanumeric() || c.is_ascii_punctuation()) && !EXCLUDED_BARE_CHARS.contains(&c)
}

/// Tokenize one input line.
pub fn tokenize(line: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();

    while i < chars.len() {
        let c = chars[i];

        if c == ' ' || c == '\t' {
            i += 1;
            continue;
        }

        if c == ';' {
            tokens.push(Token::Semi);
            i += 1;
            continue;
        }

        if c == '|' {
            if chars.get(i + 1) == Some(&'|') {
                tokens.push(Token::PipePipe);
                i += 2;
            } else {
                tokens.push(Token::Pipe);
                i += 1;
            }
            continue;
        }

        if c == '&' {
            if chars.get(i + 1) == Some(&'&') {
                tokens.push(Token::AmpAmp);
                i += 2;
            } else {
                tokens.push(Token::Amp);
                i += 1;
            }
            continue;
        }

        if let Some((token, next_i)) = try_redirect(&chars, i) {
            tokens.push(token);
            i = next_i;
            continue;
        }

        let (word, next_i) = scan_word(&chars, i)?;
        tokens.push(Token::Word(word));
        i = next_i;
    }

    Ok(tokens)
}

/// Attempt to lex a redirection operator starting at `i`. Returns `None`
/// (consuming nothing) if `i` is not the start of one, so the caller falls
/// through to ordinary word scanning.
fn try_redirect(chars: &[char], i: usize) -> Option<(Token, usize)> {
    let mut j = i;
    let mut digits = String::new();
    while chars.get(j).is_some_and(|c| c.is_ascii_digit()) {
        digits.push(chars[j]);
        j += 1;
    }

    let arrow = *chars.get(j)?;
    if arrow != '<' && arrow != '>' {
        return None;
    }
    j += 1;

    let default_fd = if arrow == '<' { 0 } else { 1 };
    let fd: i32 = if digits.is_empty() {
        default_fd
    } else {
        digits.parse().ok()?
    };

    if arrow == '<' && chars.get(j) == Some(&'<') && chars.get(j + 1) == Some(&'<') {
        return Some((
            Token::Redirect(RedirectToken { fd, form: RedirectForm::HereStringPending }),
            j + 2,
        ));
    }

    if arrow == '>' && chars.get(j) == Some(&'>') {
        return Some((
            Token::Redirect(RedirectToken { fd, form: RedirectForm::AppendFilePending }),
            j + 1,
        ));
    }

    if chars.get(j) == Some(&'&') {
        let mut k = j + 1;
        let mut target_digits = String::new();
        while chars.get(k).is_some_and(|c| c.is_ascii_digit()) {
            target_digits.push(chars[k]);
            k += 1;
        }
        if let Ok(target_fd) = target_digits.parse::<i32>() {
            return Some((
                Token::Redirect(RedirectToken { fd, form: RedirectForm::DupFd(target_fd) }),
                k,
            ));
        }
        return None;
    }

    let form = if arrow == '<' { RedirectForm::ReadFilePending } else { RedirectForm::WriteFilePending };
    Some((Token::Redirect(RedirectToken { fd, form }), j))
}

#[derive(Clone, Copy, PartialEq)]
enum QuoteState {
    Unquoted,
    Double,
    Single,
}

/// Scan one whitespace-delimited word, possibly spanning several quoted
/// and unquoted runs (`he"llo wor"ld`), starting at `i`.
fn scan_word(chars: &[char], mut i: usize) -> Result<(Word, usize), ParseError> {
    let mut segments: Vec<WordSegment> = Vec::new();
    let mut buf = String::new();
    let mut state = QuoteState::Unquoted;

    // `force`: push a segment even if `buf` is empty — needed when closing
    // a quote pair (`""` is a present-but-empty segment, not nothing).
    macro_rules! flush {
        ($force:expr) => {
            if !buf.is_empty() || $force {
                let seg = match state {
                    QuoteState::Unquoted => WordSegment::Unquoted(std::mem::take(&mut buf)),
                    QuoteState::Double => WordSegment::DoubleQuoted(std::mem::take(&mut buf)),
                    QuoteState::Single => WordSegment::SingleQuoted(std::mem::take(&mut buf)),
                };
                segments.push(seg);
            }
        };
    }

    loop {
        let Some(&c) = chars.get(i) else { break };

        match state {
            QuoteState::Unquoted => {
                if c == ' ' || c == '\t' {
                    break;
                }
                if c == '"' {
                    flush!(false);
                    state = QuoteState::Double;
                    i += 1;
                } else if c == '\'' {
                    flush!(false);
                    state = QuoteState::Single;
                    i += 1;
                } else if c == '\\' {
                    i += 1;
                    if let Some(&next) = chars.get(i) {
                        buf.push(next);
                        i += 1;
                    }
                } else if !is_bare_char(c) {
                    break;
                } else {
                    buf.push(c);
                    i += 1;
                }
            }
            QuoteState::Double => {
                if c == '"' {
                    flush!(true);
                    state = QuoteState::Unquoted;
                    i += 1;
                } else if c == '\\' {
                    match chars.get(i + 1) {
                        Some(&n @ ('"' | '\\' | '$' | '`')) => {
                            buf.push(n);
                            i += 2;
                        }
                        _ => {
                            buf.push('\\');
                            i += 1;
                        }
                    }
                } else {
                    buf.push(c);
                    i += 1;
                }
            }
            QuoteState::Single => {
                if c == '\'' {
                    flush!(true);
                    state = QuoteState::Unquoted;
                    i += 1;
                } else {
                    buf.push(c);
                    i += 1;
                }
            }
        }
    }

    if !matches!(state, QuoteState::Unquoted) {
        // Unterminated quote — treat what we have as a literal segment
        // rather than silently dropping the trailing quote's contents.
        flush!(true);
        return Ok((segments, i));
    }

    flush!(false);
    Ok((segments, i))
}

/// Parse a full line into connector-joined jobs.
pub fn parse_line(line: &str) -> Result<Vec<ChainEntry>, ParseError> {
    let tokens = tokenize(line)?;
    parse_chain(tokens, line)
}

fn connector_display(c: Connector) -> &'static str {
    match c {
        Connector::Sequence => ";",
        Connector::And => "&&",
        Connector::Or => "||",
    }
}

fn parse_chain(tokens: Vec<Token>, source: &str) -> Result<Vec<ChainEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut current: Vec<Token> = Vec::new();
    let mut next_connector = Connector::Sequence;
    // Whether the line is allowed to end right here. True after `;` or `&`
    // (both legitimately end a line: a no-op trailing separator, or a
    // backgrounded job). False after `&&`/`||`, which demand a following job.
    let mut may_end_here = true;

    let mut flush = |current: &mut Vec<Token>,
                     connector: Connector,
                     background: bool,
                     entries: &mut Vec<ChainEntry>,
                     on_empty: &str|
     -> Result<(), ParseError> {
        if current.is_empty() {
            return Err(ParseError::UnexpectedToken(on_empty.to_string()));
        }
        let pipeline = parse_pipeline(std::mem::take(current))?;
        let job = JobExp { pipeline, background };
        entries.push(ChainEntry { job, connector, text: source.trim().to_string() });
        Ok(())
    };

    for token in tokens {
        match &token {
            Token::Semi => {
                flush(&mut current, next_connector, false, &mut entries, ";")?;
                next_connector = Connector::Sequence;
                may_end_here = true;
            }
            Token::AmpAmp => {
                flush(&mut current, next_connector, false, &mut entries, "&&")?;
                next_connector = Connector::And;
                may_end_here = false;
            }
            Token::PipePipe => {
                flush(&mut current, next_connector, false, &mut entries, "||")?;
                next_connector = Connector::Or;
                may_end_here = false;
            }
            Token::Amp => {
                flush(&mut current, next_connector, true, &mut entries, "&")?;
                next_connector = Connector::Sequence;
                may_end_here = true;
            }
            _ => current.push(token),
        }
    }

    if current.is_empty() {
        if entries.is_empty() {
            return Ok(vec![]);
        }
        if may_end_here {
            return Ok(entries);
        }
        return Err(ParseError::ExpectedCommandAfter(connector_display(next_connector).to_string()));
    }
    flush(&mut current, next_connector, false, &mut entries, connector_display(next_connector))?;

    Ok(entries)
}

/// `pipeline := command ('|' command)*`
fn parse_pipeline(tokens: Vec<Token>) -> Result<PipelineExp, ParseError> {
    let mut commands = Vec::new();
    let mut current: Vec<Token> = Vec::new();

    for token in tokens {
        if matches!(token, Token::Pipe) {
            commands.push(parse_command(std::mem::take(&mut current))?);
        } else {
            current.push(token);
        }
    }
    commands.push(parse_command(current)?);

    Ok(PipelineExp { commands })
}

/// `command := arg (arg)*`
fn parse_command(tokens: Vec<Token>) -> Result<CommandExp, ParseError> {
    let mut args = Vec::new();
    let mut iter = tokens.into_iter().peekable();

    while let Some(token) = iter.next() {
        match token {
            Token::Word(word) => args.push(Arg::Word(word)),
            Token::Redirect(RedirectToken { fd, form }) => {
                let target = match form {
                    RedirectForm::DupFd(target_fd) => RedirectTarget::DupFd(target_fd),
                    RedirectForm::ReadFilePending
                    | RedirectForm::WriteFilePending
                    | RedirectForm::AppendFilePending
                    | RedirectForm::HereStringPending => {
                        let filename = match iter.next() {
                            Some(Token::Word(word)) => word,
                            _ => {
                                let op = match form {
                                    RedirectForm::ReadFilePending => "<",
                                    RedirectForm::WriteFilePending => ">",
                                    RedirectForm::AppendFilePending => ">>",
                                    RedirectForm::HereStringPending => "<<<",
                                    RedirectForm::DupFd(_) => unreachable!(),
                                };
                                return Err(ParseError::ExpectedWordAfter { op: op.to_string() });
                            }
                        };
                        match form {
                            RedirectForm::ReadFilePending => RedirectTarget::ReadFile(filename),
                            RedirectForm::WriteFilePending => RedirectTarget::WriteFile(filename),
                            RedirectForm::AppendFilePending => RedirectTarget::AppendFile(filename),
                            RedirectForm::HereStringPending => RedirectTarget::HereString(filename),
                            RedirectForm::DupFd(_) => unreachable!(),
                        }
                    }
                };
                args.push(Arg::Redirect { fd, target });
            }
            Token::Pipe | Token::PipePipe | Token::Amp | Token::AmpAmp | Token::Semi => {
                unreachable!("operator tokens are split out before parse_command runs")
            }
        }
    }

    if args.is_empty() {
        return Err(ParseError::EmptyCommand);
    }

    Ok(CommandExp { args })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(s: &str) -> Word {
        vec![WordSegment::Unquoted(s.to_string())]
    }

    #[test]
    fn simple_command() {
        let entries = parse_line("echo hello world").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job.pipeline.commands.len(), 1);
        assert_eq!(
            entries[0].job.pipeline.commands[0].args,
            vec![Arg::Word(word("echo")), Arg::Word(word("hello")), Arg::Word(word("world"))]
        );
    }

    #[test]
    fn double_quotes_preserve_spaces() {
        let tokens = tokenize(r#"echo "hello   world""#).unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Word(word("echo")),
                Token::Word(vec![WordSegment::DoubleQuoted("hello   world".to_string())]),
            ]
        );
    }

    #[test]
    fn quotes_mid_word() {
        let tokens = tokenize(r#"he"llo wor"ld"#).unwrap();
        assert_eq!(tokens.len(), 1);
        let Token::Word(w) = &tokens[0] else { panic!() };
        assert_eq!(
            w,
            &vec![
                WordSegment::Unquoted("he".to_string()),
                WordSegment::DoubleQuoted("llo wor".to_string()),
                WordSegment::Unquoted("ld".to_string()),
            ]
        );
    }

    #[test]
    fn pipeline_two_stages() {
        let entries = parse_line("echo foo | cat").unwrap();
        assert_eq!(entries[0].job.pipeline.commands.len(), 2);
    }

    #[test]
    fn background_marker() {
        let entries = parse_line("sleep 1 &").unwrap();
        assert!(entries[0].job.background);
    }

    #[test]
    fn redirect_simple_out() {
        let entries = parse_line("echo hi > out.txt").unwrap();
        let args = &entries[0].job.pipeline.commands[0].args;
        assert_eq!(args.len(), 3);
        assert!(matches!(
            &args[2],
            Arg::Redirect { fd: 1, target: RedirectTarget::WriteFile(_) }
        ));
    }

    #[test]
    fn redirect_fd_prefixed() {
        let entries = parse_line("cmd 2>err.txt").unwrap();
        let args = &entries[0].job.pipeline.commands[0].args;
        assert!(matches!(
            &args[1],
            Arg::Redirect { fd: 2, target: RedirectTarget::WriteFile(_) }
        ));
    }

    #[test]
    fn redirect_dup_stderr_to_stdout() {
        let entries = parse_line("cmd 2>&1").unwrap();
        let args = &entries[0].job.pipeline.commands[0].args;
        assert!(matches!(&args[1], Arg::Redirect { fd: 2, target: RedirectTarget::DupFd(1) }));
    }

    #[test]
    fn redirect_dup_mid_word_digits_not_special() {
        // "file123" has no redirect meaning — digits only matter at the
        // start of a token immediately before an arrow.
        let entries = parse_line("echo file123").unwrap();
        assert_eq!(entries[0].job.pipeline.commands[0].args, vec![Arg::Word(word("echo")), Arg::Word(word("file123"))]);
    }

    #[test]
    fn chain_and_or_sequence() {
        let entries = parse_line("false && echo skipped || echo ran ; echo done").unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].connector, Connector::Sequence);
        assert_eq!(entries[1].connector, Connector::And);
        assert_eq!(entries[2].connector, Connector::Or);
        assert_eq!(entries[3].connector, Connector::Sequence);
    }

    #[test]
    fn leading_operator_is_error() {
        assert!(parse_line("&& echo hi").is_err());
    }

    #[test]
    fn trailing_operator_is_error() {
        assert!(parse_line("echo hi &&").is_err());
    }

    #[test]
    fn missing_filename_is_error() {
        assert!(parse_line("echo >").is_err());
    }

    #[test]
    fn here_string() {
        let entries = parse_line("cat <<< hello").unwrap();
        let args = &entries[0].job.pipeline.commands[0].args;
        assert!(matches!(&args[1], Arg::Redirect { fd: 0, target: RedirectTarget::HereString(_) }));
    }

    #[test]
    fn empty_line_returns_empty() {
        assert_eq!(parse_line("").unwrap().len(), 0);
        assert_eq!(parse_line("   ").unwrap().len(), 0);
    }
}
