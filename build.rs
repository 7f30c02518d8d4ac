use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only the crate's own sources are held to the house rules.
const SOURCE_DIRS: [&str; 4] = ["combine", "src", "tests", "benches"];

const UNDERSCORE_PATTERN: &str = r"\b(_[a-zA-Z0-9_]+)\b";
const FORBIDDEN_WORDS_PATTERN: &str = r"(//|/\*|///).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)";
const STARS_PATTERN: &str = r"(//|/\*).*\*\*";
const ANY_COMMENT_PATTERN: &str = r"(//|/\*|///).*";
const ALLOW_DEAD_CODE_PATTERN: &str = r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]";

/// One house rule: a line matcher plus a filter that decides whether a matching line
/// is a real violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Rule {
    UnderscoreBinding,
    ForbiddenWord,
    StarsInComment,
    AllCapsComment,
    AllowDeadCode,
}

impl Rule {
    const ALL: [Rule; 5] = [
        Rule::UnderscoreBinding,
        Rule::ForbiddenWord,
        Rule::StarsInComment,
        Rule::AllCapsComment,
        Rule::AllowDeadCode,
    ];

    fn pattern(self) -> &'static str {
        match self {
            Rule::UnderscoreBinding => UNDERSCORE_PATTERN,
            Rule::ForbiddenWord => FORBIDDEN_WORDS_PATTERN,
            Rule::StarsInComment => STARS_PATTERN,
            Rule::AllCapsComment => ANY_COMMENT_PATTERN,
            Rule::AllowDeadCode => ALLOW_DEAD_CODE_PATTERN,
        }
    }

    fn is_violation(self, line: &str) -> bool {
        match self {
            Rule::UnderscoreBinding => !is_comment(line) && !underscore_only_in_strings(line),
            Rule::ForbiddenWord | Rule::AllowDeadCode => true,
            Rule::StarsInComment => !is_doc_comment(line),
            Rule::AllCapsComment => comment_text(line).is_some_and(|text| {
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(char::is_uppercase)
            }),
        }
    }

    fn advice(self) -> &'static str {
        match self {
            Rule::UnderscoreBinding => {
                "Underscore-prefixed names are not allowed. Use the binding or remove it."
            }
            Rule::ForbiddenWord => {
                "Comments must describe the code as it is, not how it came to be. Remove the comment."
            }
            Rule::StarsInComment => "The '**' pattern is only allowed in doc comments.",
            Rule::AllCapsComment => "Comments written entirely in capitals are not allowed.",
            Rule::AllowDeadCode => "#[allow(dead_code)] is not allowed. Use the code or delete it.",
        }
    }
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || trimmed.starts_with("/*")
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

// True when every underscore-prefixed word on the line sits inside a string literal.
fn underscore_only_in_strings(line: &str) -> bool {
    if !line.contains('"') {
        return false;
    }
    line.split('"')
        .enumerate()
        .filter(|(i, _)| i % 2 == 0)
        .all(|(_, code)| {
            !code
                .split(|c: char| !c.is_alphanumeric() && c != '_')
                .any(|word| word.starts_with('_') && word.len() > 1)
        })
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    for prefix in ["///", "//!", "//"] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            return Some(rest.trim());
        }
    }
    let start = line.find("/*")? + 2;
    let rest = &line[start..];
    Some(rest.find("*/").map_or(rest, |end| &rest[..end]).trim())
}

struct RuleCollector {
    rule: Rule,
    violations: Vec<String>,
}

impl Sink for RuleCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn source_files() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn check_file(
    path: &Path,
    searcher: &mut Searcher,
    matchers: &[(Rule, RegexMatcher)],
) -> Result<(), Box<dyn Error>> {
    for (rule, matcher) in matchers {
        let mut collector = RuleCollector {
            rule: *rule,
            violations: Vec::new(),
        };
        searcher.search_path(matcher, path, &mut collector)?;
        if !collector.violations.is_empty() {
            let mut message = format!(
                "\n❌ ERROR: {} violation(s) of {:?} in {}:\n",
                collector.violations.len(),
                rule,
                path.display()
            );
            for violation in &collector.violations {
                message.push_str(&format!("   {violation}\n"));
            }
            message.push_str(&format!("\n⚠️ {}\n", rule.advice()));
            return Err(message.into());
        }
    }
    Ok(())
}

fn run_checks() -> Result<(), Box<dyn Error>> {
    let mut matchers = Vec::with_capacity(Rule::ALL.len());
    for rule in Rule::ALL {
        matchers.push((rule, RegexMatcher::new_line_matcher(rule.pattern())?));
    }

    let mut searcher = Searcher::new();
    for path in source_files() {
        check_file(&path, &mut searcher, &matchers)?;
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    if let Err(e) = run_checks() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
