//! Parser for annotated test suites.
//!
//! A suite is a list of code words (`.long 0x...`) grouped into cases by `test_<name>:` labels.
//! Inputs and expected outputs are given by `#_` annotations inside each case:
//!
//! ```text
//! test_add:
//!   #_ REGISTER_IN r4 7
//!   #_ REGISTER_OUT r3 12
//!   .long 0x7c632214   # add r3, r3, r4
//!   .long 0x4e800020   # blr
//! ```

use anyhow::Context;

#[derive(Debug, Clone, PartialEq)]
pub struct Suite {
    /// The code of every case, in file order.
    pub words: Vec<u32>,
    pub cases: Vec<TestCase>,
}

impl Suite {
    /// The suite code as it is laid out in guest memory.
    pub fn code_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|x| x.to_be_bytes()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub name: String,
    pub line: usize,
    /// Byte offset of the first instruction of the case from the start of the suite.
    pub offset: u32,
    pub inputs: Vec<Assignment>,
    pub outputs: Vec<Assignment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    Mem { addr: u32, value: Vec<u8> },
    Register { name: String, value: u128 },
}

impl std::fmt::Display for Assignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mem { addr, value } => {
                write!(f, "mem[{addr:#x}] =")?;
                value.iter().try_for_each(|x| write!(f, " {x:02x}"))
            }
            Self::Register { name, value } => write!(f, "{name} = {value:#x}"),
        }
    }
}

pub fn parse(input: &str) -> anyhow::Result<Suite> {
    let mut suite = Suite { words: vec![], cases: vec![] };

    for (i, line) in input.lines().enumerate() {
        let line_number = i + 1;
        parse_line(&mut suite, line.trim(), line_number)
            .with_context(|| format!("line {line_number}: {}", line.trim()))?;
    }

    for case in &suite.cases {
        if case.offset as usize >= suite.words.len() * 4 {
            anyhow::bail!("test_{} (line {}) has no code", case.name, case.line);
        }
    }

    Ok(suite)
}

fn parse_line(suite: &mut Suite, line: &str, line_number: usize) -> anyhow::Result<()> {
    if let Some(annotation) = line.strip_prefix("#_") {
        let case = suite.cases.last_mut().context("annotation outside of a test case")?;
        return parse_annotation(case, annotation.trim());
    }

    let line = strip_comment(line);
    if line.is_empty() {
        return Ok(());
    }

    if let Some(label) = line.strip_prefix("test_") {
        let name = label.strip_suffix(':').context("expected `:` after test label")?;
        if name.is_empty() {
            anyhow::bail!("empty test name");
        }
        if suite.cases.iter().any(|x| x.name == name) {
            anyhow::bail!("duplicate test case: {name}");
        }
        suite.cases.push(TestCase {
            name: name.to_owned(),
            line: line_number,
            offset: (suite.words.len() * 4) as u32,
            inputs: vec![],
            outputs: vec![],
        });
        return Ok(());
    }

    if let Some(words) = line.strip_prefix(".long") {
        if suite.cases.is_empty() {
            anyhow::bail!("code outside of a test case");
        }
        for word in words.split(',').map(str::trim) {
            suite.words.push(parse_int(word)? as u32);
        }
        return Ok(());
    }

    // Other assembler directives (`.text`, `.align`, ...) carry no information for the runner.
    if line.starts_with('.') {
        return Ok(());
    }

    anyhow::bail!("unexpected input")
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => line[..pos].trim(),
        None => line,
    }
}

fn parse_annotation(case: &mut TestCase, annotation: &str) -> anyhow::Result<()> {
    let (key, rest) = split_word(annotation).context("expected annotation key")?;
    let (target, value) = split_word(rest).context("expected annotation target")?;
    let value = value.trim();

    let assignment = match key {
        "REGISTER_IN" | "REGISTER_OUT" => {
            Assignment::Register { name: target.to_owned(), value: parse_register(target, value)? }
        }
        "MEMORY_IN" | "MEMORY_OUT" => {
            Assignment::Mem { addr: parse_int(target)? as u32, value: parse_bytes(value)? }
        }
        _ => anyhow::bail!("unknown annotation: {key}"),
    };

    match key.ends_with("_IN") {
        true => case.inputs.push(assignment),
        false => case.outputs.push(assignment),
    }
    Ok(())
}

fn split_word(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }
    Some(input.split_at(input.find(char::is_whitespace).unwrap_or(input.len())))
}

/// Parses `0x` prefixed hexadecimal or (possibly negative) decimal integers.
fn parse_int(value: &str) -> anyhow::Result<u64> {
    let value = value.replace('_', "");
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None if value.starts_with('-') => value.parse::<i64>().ok().map(|x| x as u64),
        None => value.parse::<u64>().ok(),
    };
    parsed.with_context(|| format!("invalid integer: {value}"))
}

/// Float registers accept floating point literals, vector registers accept `[w0, w1, w2, w3]`
/// with `w0` as the most significant word.
fn parse_register(name: &str, value: &str) -> anyhow::Result<u128> {
    if value.is_empty() {
        anyhow::bail!("missing value for {name}");
    }

    let is_indexed = |prefix: &str| {
        let index = name.strip_prefix(prefix).unwrap_or("");
        !index.is_empty() && index.bytes().all(|x| x.is_ascii_digit())
    };

    if is_indexed("v") {
        if let Some(words) = value.strip_prefix('[').and_then(|x| x.strip_suffix(']')) {
            let words: Vec<u64> =
                words.split(',').map(|x| parse_int(x.trim())).collect::<anyhow::Result<_>>()?;
            if words.len() != 4 {
                anyhow::bail!("expected 4 words for {name}, got {}", words.len());
            }
            return Ok(words.iter().fold(0, |acc, x| (acc << 32) | (*x as u32) as u128));
        }
    }

    if is_indexed("f") && !value.starts_with("0x") {
        let float: f64 = value.parse().with_context(|| format!("invalid float: {value}"))?;
        return Ok(float.to_bits() as u128);
    }

    Ok(parse_int(value)? as u128)
}

fn parse_bytes(value: &str) -> anyhow::Result<Vec<u8>> {
    let digits: String = value.chars().filter(|x| !x.is_whitespace()).collect();
    if digits.is_empty() || digits.len() % 2 != 0 || !digits.is_ascii() {
        anyhow::bail!("expected an even number of hex digits: {value}");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid byte: {}", &digits[i..i + 2]))
        })
        .collect()
}
