use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding project sources. Everything else in the tree is ignored.
const SOURCE_ROOTS: [&str; 4] = ["engine", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: &str = "FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE";

// One source-hygiene rule: a line regex, a filter deciding whether a matching
// line is a real violation, and the advice printed when it is.
struct Rule {
    description: &'static str,
    pattern: String,
    accept: fn(&str) -> bool,
    advice: &'static str,
    check_build_script: bool,
}

struct RuleCollector<'a> {
    rule: &'a Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl<'a> RuleCollector<'a> {
    fn new(rule: &'a Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut message = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.description,
            self.file_path.display()
        );
        for violation in &self.violations {
            message.push_str(&format!("   {violation}\n"));
        }
        message.push_str(&format!("\n⚠️ {}\n", self.rule.advice));
        Some(message)
    }
}

impl Sink for RuleCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.rule.accept)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || line.contains("/*")
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(rest.trim_start_matches(['/', '!']).trim());
    }
    let start = line.find("/*")? + 2;
    let body = &line[start..];
    Some(body.find("*/").map_or(body, |end| &body[..end]).trim())
}

// Underscore-prefixed names are allowed inside string literals and comments only.
fn is_underscore_binding(line: &str) -> bool {
    if is_comment(line) {
        return false;
    }
    let inside_string = line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    !inside_string
}

fn always(_: &str) -> bool {
    true
}

fn is_stars_outside_docs(line: &str) -> bool {
    !is_doc_comment(line)
}

fn is_shouted_comment(line: &str) -> bool {
    let Some(text) = comment_text(line) else {
        return false;
    };
    let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            description: "underscore-prefixed bindings",
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            accept: is_underscore_binding,
            advice: "Underscore-prefixed names are not allowed. Use the binding or remove it.",
            check_build_script: true,
        },
        Rule {
            description: "forbidden comment words",
            pattern: format!(r"(//|/\*).*(?:{FORBIDDEN_WORDS})"),
            accept: always,
            advice: "Comments narrating edits are not allowed. Delete them rather than rewording.",
            check_build_script: false,
        },
        Rule {
            description: "'**' markers in plain comments",
            pattern: r"(//|/\*).*\*\*".to_string(),
            accept: is_stars_outside_docs,
            advice: "'**' is only allowed in doc comments.",
            check_build_script: false,
        },
        Rule {
            description: "all-uppercase comments",
            pattern: r"(//|/\*).*".to_string(),
            accept: is_shouted_comment,
            advice: "Comments written entirely in capitals are not allowed.",
            check_build_script: false,
        },
        Rule {
            description: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            accept: always,
            advice: "Use the code or remove it; dead code may not be silenced.",
            check_build_script: false,
        },
    ]
}

fn project_sources() -> Vec<PathBuf> {
    SOURCE_ROOTS
        .iter()
        .filter(|root| Path::new(root).is_dir())
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn check_sources() -> Result<(), Box<dyn Error>> {
    let sources = project_sources();
    let build_script = PathBuf::from("build.rs");
    let mut searcher = Searcher::new();

    for rule in rules() {
        let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
        let extra = rule.check_build_script.then_some(&build_script);
        for path in sources.iter().chain(extra) {
            let mut collector = RuleCollector::new(&rule, path);
            searcher.search_path(&matcher, path, &mut collector)?;
            if let Some(message) = collector.error_message() {
                return Err(message.into());
            }
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    if let Err(e) = check_sources() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
