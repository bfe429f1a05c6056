//! A line-oriented parser for the breakpad text symbol format.
//!
//! Symbol files are line based: a leading keyword decides the record type,
//! and `FUNC`/`STACK CFI INIT` records own the indented-looking lines that
//! follow them. The parser here is incremental so large files can be fed
//! in chunks.

use nom::branch::alt;
use nom::bytes::complete::{tag, take_until};
use nom::character::complete::{alphanumeric1, char, digit1, hex_digit1, not_line_ending, space1};
use nom::combinator::{map, map_res, opt};
use nom::multi::many0;
use nom::sequence::{preceded, terminated};
use nom::IResult;
use range_map::{Range, RangeMap};
use tracing::warn;

use std::collections::HashMap;
use std::fmt::Debug;
use std::str;
use std::str::FromStr;

use crate::sym_file::types::*;
use crate::SymbolError;

#[derive(Debug)]
enum Line {
    Module,
    Info,
    File(u32, String),
    Public(PublicSymbol),
    Function(Function, Vec<SourceLine>),
    StackWin(WinFrameType),
    StackCfi(StackInfoCfi),
}

// Some Windows toolchains emit multiple carriage returns before the
// line feed.
fn my_eol(input: &[u8]) -> IResult<&[u8], char> {
    preceded(many0(char('\r')), char('\n'))(input)
}

fn hex_str_u64(input: &[u8]) -> IResult<&[u8], u64> {
    map_res(map_res(hex_digit1, str::from_utf8), |s| {
        u64::from_str_radix(s, 16)
    })(input)
}

fn hex_str_u32(input: &[u8]) -> IResult<&[u8], u32> {
    map_res(map_res(hex_digit1, str::from_utf8), |s| {
        u32::from_str_radix(s, 16)
    })(input)
}

fn decimal_u32(input: &[u8]) -> IResult<&[u8], u32> {
    map_res(map_res(digit1, str::from_utf8), u32::from_str)(input)
}

fn rest_of_line(input: &[u8]) -> IResult<&[u8], &str> {
    terminated(map_res(not_line_ending, str::from_utf8), my_eol)(input)
}

// Matches a MODULE record. The contents are not used, but the line must
// be well formed.
fn module_line(input: &[u8]) -> IResult<&[u8], ()> {
    let (input, _) = terminated(tag("MODULE"), space1)(input)?;
    // os
    let (input, _) = terminated(alphanumeric1, space1)(input)?;
    // cpu
    let (input, _) = terminated(take_until(" "), space1)(input)?;
    // debug id
    let (input, _) = terminated(hex_digit1, space1)(input)?;
    // filename
    let (input, _) = rest_of_line(input)?;
    Ok((input, ()))
}

// Matches an INFO record. These carry optional metadata we don't use.
fn info_line(input: &[u8]) -> IResult<&[u8], ()> {
    let (input, _) = terminated(tag("INFO"), space1)(input)?;
    let (input, _) = rest_of_line(input)?;
    Ok((input, ()))
}

// Matches a FILE record.
fn file_line(input: &[u8]) -> IResult<&[u8], (u32, String)> {
    let (input, _) = terminated(tag("FILE"), space1)(input)?;
    let (input, id) = terminated(decimal_u32, space1)(input)?;
    let (input, filename) = rest_of_line(input)?;
    Ok((input, (id, filename.to_string())))
}

// Matches a PUBLIC record.
fn public_line(input: &[u8]) -> IResult<&[u8], PublicSymbol> {
    let (input, _) = tag("PUBLIC")(input)?;
    let (input, _) = opt(preceded(space1, tag("m")))(input)?;
    let (input, _) = space1(input)?;
    let (input, address) = terminated(hex_str_u64, space1)(input)?;
    let (input, parameter_size) = terminated(hex_str_u32, space1)(input)?;
    let (input, name) = rest_of_line(input)?;
    Ok((
        input,
        PublicSymbol {
            address,
            parameter_size,
            name: name.to_string(),
        },
    ))
}

// Matches a FUNC record.
fn func_line(input: &[u8]) -> IResult<&[u8], Function> {
    let (input, _) = tag("FUNC")(input)?;
    let (input, _) = opt(preceded(space1, tag("m")))(input)?;
    let (input, _) = space1(input)?;
    let (input, address) = terminated(hex_str_u64, space1)(input)?;
    let (input, size) = terminated(hex_str_u32, space1)(input)?;
    let (input, parameter_size) = terminated(hex_str_u32, space1)(input)?;
    let (input, name) = rest_of_line(input)?;
    Ok((
        input,
        Function {
            address,
            size,
            parameter_size,
            name: name.to_string(),
            lines: RangeMap::new(),
        },
    ))
}

// Matches line data after a FUNC record.
fn func_line_data(input: &[u8]) -> IResult<&[u8], SourceLine> {
    let (input, address) = terminated(hex_str_u64, space1)(input)?;
    let (input, size) = terminated(hex_str_u32, space1)(input)?;
    let (input, line) = terminated(decimal_u32, space1)(input)?;
    let (input, file) = decimal_u32(input)?;
    let (input, _) = my_eol(input)?;
    Ok((
        input,
        SourceLine {
            address,
            size,
            file,
            line,
        },
    ))
}

// Matches a STACK WIN record.
fn stack_win_line(input: &[u8]) -> IResult<&[u8], WinFrameType> {
    let (input, _) = terminated(tag("STACK WIN"), space1)(input)?;
    let (input, ty) = terminated(hex_digit1, space1)(input)?;
    let (input, address) = terminated(hex_str_u64, space1)(input)?;
    let (input, code_size) = terminated(hex_str_u32, space1)(input)?;
    let (input, prologue_size) = terminated(hex_str_u32, space1)(input)?;
    let (input, epilogue_size) = terminated(hex_str_u32, space1)(input)?;
    let (input, parameter_size) = terminated(hex_str_u32, space1)(input)?;
    let (input, saved_register_size) = terminated(hex_str_u32, space1)(input)?;
    let (input, local_size) = terminated(hex_str_u32, space1)(input)?;
    let (input, max_stack_size) = terminated(hex_str_u32, space1)(input)?;
    let (input, has_program_string) = terminated(
        map(map_res(digit1, str::from_utf8), |s| s == "1"),
        space1,
    )(input)?;
    let (input, rest) = rest_of_line(input)?;

    // Sometimes has_program_string is just wrong. It's rare enough that
    // it's better to play it safe and discard the inconsistent entry.
    let really_has_program_string = ty == b"4";
    if really_has_program_string != has_program_string {
        warn!(
            "STACK WIN entry had inconsistent type and has_program_string, discarding: type {} has_program_string {} final arg {}",
            str::from_utf8(ty).unwrap_or(""),
            has_program_string,
            rest
        );
        return Ok((input, WinFrameType::Unhandled));
    }

    let program_string_or_base_pointer = if really_has_program_string {
        WinStackThing::ProgramString(rest.to_string())
    } else {
        WinStackThing::AllocatesBasePointer(rest == "1")
    };
    let info = StackInfoWin {
        address,
        size: code_size,
        prologue_size,
        epilogue_size,
        parameter_size,
        saved_register_size,
        local_size,
        max_stack_size,
        program_string_or_base_pointer,
    };
    let frame_type = match ty {
        b"4" => WinFrameType::FrameData(info),
        b"0" => WinFrameType::Fpo(info),
        _ => WinFrameType::Unhandled,
    };
    Ok((input, frame_type))
}

// Matches a STACK CFI INIT record.
fn stack_cfi_init(input: &[u8]) -> IResult<&[u8], StackInfoCfi> {
    let (input, _) = terminated(tag("STACK CFI INIT"), space1)(input)?;
    let (input, address) = terminated(hex_str_u64, space1)(input)?;
    let (input, size) = terminated(hex_str_u32, space1)(input)?;
    let (input, rules) = rest_of_line(input)?;
    Ok((
        input,
        StackInfoCfi {
            init: CfiRules {
                address,
                rules: rules.to_string(),
            },
            size,
            add_rules: Default::default(),
        },
    ))
}

// Matches a STACK CFI record, a delta line belonging to the preceding
// STACK CFI INIT.
fn stack_cfi(input: &[u8]) -> IResult<&[u8], CfiRules> {
    let (input, _) = terminated(tag("STACK CFI"), space1)(input)?;
    let (input, address) = terminated(hex_str_u64, space1)(input)?;
    let (input, rules) = rest_of_line(input)?;
    Ok((
        input,
        CfiRules {
            address,
            rules: rules.to_string(),
        },
    ))
}

// Parse any of the line data that can occur in the body of a symbol file.
fn line(input: &[u8]) -> IResult<&[u8], Line> {
    alt((
        map(info_line, |_| Line::Info),
        map(file_line, |(i, f)| Line::File(i, f)),
        map(public_line, Line::Public),
        map(func_line, |f| Line::Function(f, Vec::new())),
        map(stack_win_line, Line::StackWin),
        map(stack_cfi_init, Line::StackCfi),
        map(module_line, |_| Line::Module),
    ))(input)
}

/// A streaming parser for symbol files.
///
/// Feed input with [`SymbolParser::parse_more`] until it is exhausted,
/// then call [`SymbolParser::finish`].
#[derive(Debug, Default)]
pub struct SymbolParser {
    files: HashMap<u32, String>,
    publics: Vec<PublicSymbol>,

    // We need sorted vecs of this shape to build the RangeMaps anyway,
    // so build them directly instead of collecting twice.
    functions: Vec<(Range<u64>, Function)>,
    cfi_stack_info: Vec<(Range<u64>, StackInfoCfi)>,
    win_stack_framedata_info: Vec<(Range<u64>, StackInfoWin)>,
    win_stack_fpo_info: Vec<(Range<u64>, StackInfoWin)>,
    pub lines: u64,
    cur_item: Option<Line>,
}

impl SymbolParser {
    pub fn new() -> SymbolParser {
        Self::default()
    }

    /// Parses as much of the input as it can and returns how many bytes
    /// were consumed. The unused tail must be resubmitted on the next
    /// call, along with more data.
    pub fn parse_more(&mut self, mut input: &[u8]) -> Result<usize, SymbolError> {
        // Trim away everything after the last newline; a trailing partial
        // line cannot be told apart from a truncated record.
        input = if let Some(idx) = input.iter().rposition(|&x| x == b'\n') {
            &input[..idx + 1]
        } else {
            return Ok(0);
        };
        let orig_input = input;

        loop {
            if input.is_empty() {
                return Ok(orig_input.len());
            }

            // If we're in the middle of a multi-line item (`FUNC` or
            // `STACK CFI INIT`), try its subline format first. A parse
            // failure just means the item is over and the line belongs to
            // the top-level parser; genuinely corrupt lines will fail
            // there too.
            match self.cur_item.take() {
                Some(Line::Function(cur, mut lines)) => match func_line_data(input) {
                    Ok((new_input, line)) => {
                        lines.push(line);
                        input = new_input;
                        self.cur_item = Some(Line::Function(cur, lines));
                        self.lines += 1;
                        continue;
                    }
                    Err(_) => {
                        self.finish_item(Line::Function(cur, lines));
                        continue;
                    }
                },
                Some(Line::StackCfi(mut cur)) => match stack_cfi(input) {
                    Ok((new_input, line)) => {
                        cur.add_rules.push(line);
                        input = new_input;
                        self.cur_item = Some(Line::StackCfi(cur));
                        self.lines += 1;
                        continue;
                    }
                    Err(_) => {
                        self.finish_item(Line::StackCfi(cur));
                        continue;
                    }
                },
                _ => {}
            }

            let line = match line(input) {
                Ok((new_input, line)) => {
                    input = new_input;
                    line
                }
                Err(_) => {
                    // A completely corrupt line; conservatively reject the
                    // entire parse.
                    return Err(SymbolError::ParseError("failed to parse file", self.lines));
                }
            };

            match line {
                Line::Module => {
                    // We don't use this but it MUST be the first line
                    if self.lines != 0 {
                        return Err(SymbolError::ParseError(
                            "MODULE line found after the start of the file",
                            self.lines,
                        ));
                    }
                }
                Line::Info => {}
                Line::File(id, filename) => {
                    self.files.insert(id, filename);
                }
                Line::Public(p) => {
                    self.publics.push(p);
                }
                Line::StackWin(frame_type) => match frame_type {
                    WinFrameType::FrameData(s) => {
                        insert_win_stack_info(&mut self.win_stack_framedata_info, s);
                    }
                    WinFrameType::Fpo(s) => {
                        insert_win_stack_info(&mut self.win_stack_fpo_info, s);
                    }
                    _ => {}
                },
                item @ Line::Function(_, _) => {
                    // More sublines to parse
                    self.cur_item = Some(item);
                }
                item @ Line::StackCfi(_) => {
                    // More sublines to parse
                    self.cur_item = Some(item);
                }
            }

            self.lines += 1;
        }
    }

    /// Finish processing an item which had sublines, now that we have
    /// them all.
    fn finish_item(&mut self, item: Line) {
        match item {
            Line::Function(mut cur, lines) => {
                cur.lines = into_rangemap_safe(
                    lines
                        .into_iter()
                        .filter_map(|l| {
                            // Line data from PDB files often has zero-size
                            // entries, just drop those.
                            if l.size == 0 {
                                return None;
                            }
                            let end = l.address.checked_add(l.size as u64 - 1)?;
                            Some((Range::new(l.address, end), l))
                        })
                        .collect(),
                );
                if let Some(range) = cur.memory_range() {
                    self.functions.push((range, cur));
                }
            }
            Line::StackCfi(mut cur) => {
                cur.add_rules.sort();
                if let Some(range) = cur.memory_range() {
                    self.cfi_stack_info.push((range, cur));
                }
            }
            _ => {
                unreachable!()
            }
        }
    }

    /// Finish the parse and create the final [`SymbolFile`].
    ///
    /// Call this when the parser has consumed all the input.
    pub fn finish(mut self) -> SymbolFile {
        if let Some(item) = self.cur_item.take() {
            self.finish_item(item);
        }

        self.publics.sort();

        SymbolFile {
            files: self.files,
            publics: self.publics,
            functions: into_rangemap_safe(self.functions),
            cfi_stack_info: into_rangemap_safe(self.cfi_stack_info),
            win_stack_framedata_info: into_rangemap_safe(self.win_stack_framedata_info),
            win_stack_fpo_info: into_rangemap_safe(self.win_stack_fpo_info),
        }
    }
}

// PDB files contain lots of overlapping unwind info, so we have to filter
// some of it out when collecting STACK WIN entries.
fn insert_win_stack_info(stack_win: &mut Vec<(Range<u64>, StackInfoWin)>, info: StackInfoWin) {
    let memory_range = match info.memory_range() {
        Some(range) => range,
        None => {
            warn!("STACK WIN entry had invalid range, dropping it {:?}", info);
            return;
        }
    };
    if let Some((last_range, last_info)) = stack_win.last_mut() {
        if last_range.intersects(&memory_range) {
            if info.address > last_info.address {
                // Sometimes every entry has an accurate starting point but
                // a length covering the whole function. The next entry's
                // start then defines the true length of the previous one.
                last_info.size = (info.address - last_info.address) as u32;
                if let Some(range) = last_info.memory_range() {
                    *last_range = range;
                }
            } else if *last_range != memory_range {
                // Identical duplicates happen and are silently dropped;
                // non-trivial ones deserve a complaint.
                warn!("STACK WIN entry had bad intersections, dropping it {:?}", info);
                return;
            }
        }
    }
    stack_win.push((memory_range, info));
}

/// Turn a possibly-overlapping set of ranges into a [`RangeMap`]: sort,
/// drop later entries that overlap an earlier one with a different value,
/// and merge adjacent equal values.
pub(crate) fn into_rangemap_safe<V: Clone + Eq + Debug>(
    mut input: Vec<(Range<u64>, V)>,
) -> RangeMap<u64, V> {
    input.sort_by_key(|x| x.0);
    let mut vec: Vec<(Range<u64>, V)> = Vec::with_capacity(input.len());
    for (range, val) in input {
        if let Some((last_range, last_val)) = vec.last_mut() {
            if range.start <= last_range.end && val != *last_val {
                continue;
            }

            if range.start <= last_range.end.saturating_add(1) && &val == last_val {
                last_range.end = std::cmp::max(range.end, last_range.end);
                continue;
            }
        }
        vec.push((range, val));
    }
    vec.into_iter().collect()
}
