use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use regex_syntax::hir::{self, Class, ClassUnicode, ClassUnicodeRange, Dot, Hir, HirKind};
use regex_syntax::ParserBuilder;
use trawl_core::{Error, RepoId};
use trawl_proto::PatternInfo;

use crate::partition::IndexedRepoRevs;

/// Query tree understood by the index backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Q {
    Const(bool),
    Substring {
        pattern: String,
        case_sensitive: bool,
        file_name: bool,
        content: bool,
    },
    Regexp {
        regexp: String,
        case_sensitive: bool,
        file_name: bool,
        content: bool,
    },
    Language(String),
    /// Restricts the search to the listed repositories at the given branch.
    RepoBranches(BTreeMap<String, BTreeSet<RepoId>>),
    And(Vec<Q>),
    Or(Vec<Q>),
    Not(Box<Q>),
}

impl Q {
    pub fn and(children: Vec<Q>) -> Q {
        Q::And(children)
    }

    pub fn or(children: Vec<Q>) -> Q {
        Q::Or(children)
    }

    pub fn not(child: Q) -> Q {
        Q::Not(Box::new(child))
    }

    /// Flattens nested boolean nodes and folds constants.
    pub fn simplify(self) -> Q {
        match self {
            Q::And(children) => {
                let mut out = Vec::with_capacity(children.len());
                for child in children.into_iter().map(Q::simplify) {
                    match child {
                        Q::Const(true) => {}
                        Q::Const(false) => return Q::Const(false),
                        Q::And(nested) => out.extend(nested),
                        other => out.push(other),
                    }
                }
                match out.len() {
                    0 => Q::Const(true),
                    1 => out.remove(0),
                    _ => Q::And(out),
                }
            }
            Q::Or(children) => {
                let mut out = Vec::with_capacity(children.len());
                for child in children.into_iter().map(Q::simplify) {
                    match child {
                        Q::Const(false) => {}
                        Q::Const(true) => return Q::Const(true),
                        Q::Or(nested) => out.extend(nested),
                        other => out.push(other),
                    }
                }
                match out.len() {
                    0 => Q::Const(false),
                    1 => out.remove(0),
                    _ => Q::Or(out),
                }
            }
            Q::Not(child) => match child.simplify() {
                Q::Const(value) => Q::Const(!value),
                Q::Not(inner) => *inner,
                other => Q::not(other),
            },
            Q::RepoBranches(branches) if branches.values().all(BTreeSet::is_empty) => {
                Q::Const(false)
            }
            other => other,
        }
    }
}

fn scope_prefix(file_name: bool, content: bool) -> &'static str {
    match (file_name, content) {
        (true, false) => "file_",
        (false, true) => "content_",
        _ => "",
    }
}

impl fmt::Display for Q {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Q::Const(true) => f.write_str("TRUE"),
            Q::Const(false) => f.write_str("FALSE"),
            Q::Substring {
                pattern,
                case_sensitive,
                file_name,
                content,
            } => {
                let case = if *case_sensitive { "case_" } else { "" };
                write!(f, "{case}{}substr:{pattern:?}", scope_prefix(*file_name, *content))
            }
            Q::Regexp {
                regexp,
                case_sensitive,
                file_name,
                content,
            } => {
                let case = if *case_sensitive { "case_" } else { "" };
                write!(f, "{case}{}regex:{regexp:?}", scope_prefix(*file_name, *content))
            }
            Q::Language(lang) => write!(f, "lang:{lang}"),
            Q::RepoBranches(branches) => {
                f.write_str("(repobranches")?;
                for (branch, repos) in branches {
                    let ids: Vec<String> = repos.iter().map(ToString::to_string).collect();
                    write!(f, " {branch}:{}", ids.join(","))?;
                }
                f.write_str(")")
            }
            Q::And(children) | Q::Or(children) => {
                let op = if matches!(self, Q::And(_)) { "and" } else { "or" };
                write!(f, "({op}")?;
                for child in children {
                    write!(f, " {child}")?;
                }
                f.write_str(")")
            }
            Q::Not(child) => write!(f, "(not {child})"),
        }
    }
}

/// Compiles [`PatternInfo`] into the index backend's [`Q`] tree.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryCompiler;

impl QueryCompiler {
    pub fn new() -> Self {
        Self
    }

    /// The pattern and path filters of `pattern`, simplified. Repository restrictions are added
    /// separately with [`QueryCompiler::repo_branches_query`].
    ///
    /// Structural patterns have no index representation and fail with `Permanent`.
    pub fn compile(&self, pattern: &PatternInfo) -> Result<Q, Error> {
        if pattern.is_structural {
            return Err(Error::permanent(format!(
                "structural pattern {:?} cannot be searched in the index",
                pattern.pattern
            )));
        }
        let mut and = Vec::new();

        let (file_name, content) =
            match (pattern.pattern_matches_path, pattern.pattern_matches_content) {
                (false, false) => (true, true),
                scope => scope,
            };

        if !pattern.pattern.is_empty() {
            let q = if pattern.is_regexp || pattern.is_word_match {
                let regexp = if pattern.is_word_match {
                    let inner = if pattern.is_regexp {
                        pattern.pattern.clone()
                    } else {
                        regex_syntax::escape(&pattern.pattern)
                    };
                    format!(r"\b(?:{inner})\b")
                } else {
                    pattern.pattern.clone()
                };
                parse_regexp(&regexp, pattern.is_case_sensitive, file_name, content)?
            } else {
                Q::Substring {
                    pattern: pattern.pattern.clone(),
                    case_sensitive: pattern.is_case_sensitive,
                    file_name,
                    content,
                }
            };
            and.push(if pattern.is_negated { Q::not(q) } else { q });
        }

        for include in &pattern.include_patterns {
            and.push(self.file_regexp(include, pattern.path_patterns_are_case_sensitive)?);
        }
        if let Some(exclude) = pattern.exclude_pattern.as_deref().filter(|p| !p.is_empty()) {
            and.push(Q::not(
                self.file_regexp(exclude, pattern.path_patterns_are_case_sensitive)?,
            ));
        }
        if !pattern.languages.is_empty() {
            and.push(Q::or(
                pattern.languages.iter().cloned().map(Q::Language).collect(),
            ));
        }

        Ok(Q::and(and).simplify())
    }

    /// A file-name predicate for one path regex.
    pub fn file_regexp(&self, pattern: &str, case_sensitive: bool) -> Result<Q, Error> {
        parse_regexp(pattern, case_sensitive, true, false)
    }

    /// One file-name-only query per path regex, used to test whether a repository contains a file.
    pub fn file_only_queries(
        &self,
        patterns: &[String],
        case_sensitive: bool,
    ) -> Result<Vec<Q>, Error> {
        patterns
            .iter()
            .map(|pattern| Ok(self.file_regexp(pattern, case_sensitive)?.simplify()))
            .collect()
    }

    /// Restricts a query to exactly the indexed repository branches of a partition.
    pub fn repo_branches_query(&self, indexed: &IndexedRepoRevs) -> Q {
        Q::RepoBranches(indexed.repo_branches().clone())
    }

    /// The full query for the indexed side of a search.
    pub fn compile_for(
        &self,
        pattern: &PatternInfo,
        indexed: &IndexedRepoRevs,
    ) -> Result<Q, Error> {
        let pattern_q = self.compile(pattern)?;
        Ok(Q::and(vec![self.repo_branches_query(indexed), pattern_q]).simplify())
    }
}

/// Parses `pattern` and collapses it to a substring query when it is a plain literal.
fn parse_regexp(
    pattern: &str,
    case_sensitive: bool,
    file_name: bool,
    content: bool,
) -> Result<Q, Error> {
    let hir = ParserBuilder::new()
        .dot_matches_new_line(false)
        .build()
        .parse(pattern)
        .map_err(|err| Error::permanent(format!("invalid regular expression {pattern:?}: {err}")))?;
    let hir = any_char_not_newline(hir);

    if let HirKind::Literal(hir::Literal(bytes)) = hir.kind() {
        if let Ok(literal) = std::str::from_utf8(bytes) {
            return Ok(Q::Substring {
                pattern: literal.to_owned(),
                case_sensitive,
                file_name,
                content,
            });
        }
    }
    Ok(Q::Regexp {
        regexp: hir.to_string(),
        case_sensitive,
        file_name,
        content,
    })
}

/// Rewrites every "any character" class (e.g. `(?s:.)`) so it no longer matches `\n`. The index
/// matches line by line.
fn any_char_not_newline(hir: Hir) -> Hir {
    match hir.into_kind() {
        HirKind::Class(Class::Unicode(class)) if is_any_char(&class) => {
            Hir::dot(Dot::AnyCharExceptLF)
        }
        HirKind::Class(Class::Bytes(class))
            if class.ranges().len() == 1
                && class.ranges()[0].start() == 0
                && class.ranges()[0].end() == 0xFF =>
        {
            Hir::dot(Dot::AnyByteExceptLF)
        }
        HirKind::Repetition(mut rep) => {
            rep.sub = Box::new(any_char_not_newline(*rep.sub));
            Hir::repetition(rep)
        }
        HirKind::Capture(mut cap) => {
            cap.sub = Box::new(any_char_not_newline(*cap.sub));
            Hir::capture(cap)
        }
        HirKind::Concat(subs) => Hir::concat(subs.into_iter().map(any_char_not_newline).collect()),
        HirKind::Alternation(subs) => {
            Hir::alternation(subs.into_iter().map(any_char_not_newline).collect())
        }
        HirKind::Empty => Hir::empty(),
        HirKind::Literal(lit) => Hir::literal(lit.0),
        HirKind::Class(class) => Hir::class(class),
        HirKind::Look(look) => Hir::look(look),
    }
}

fn is_any_char(class: &ClassUnicode) -> bool {
    class.ranges() == [ClassUnicodeRange::new('\0', char::MAX)]
}
