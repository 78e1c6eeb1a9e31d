//! Dependency specifier extraction.
//!
//! Pulls `require("...")` / `import ... from "..."` specifiers out of script
//! sources and `@import` specifiers out of stylesheets without executing or
//! fully parsing them. The scanner is a single forward pass: strings,
//! template literals and comments are skipped wholesale, so specifiers that
//! only appear inside them are never collected. Malformed input degrades to
//! a best-effort result; the scan always terminates in linear time.
//!
//! Branches guarded by a constant string comparison (`if ("a" == "b")`) are
//! evaluated statically: specifiers inside a branch that can never execute
//! are not collected. Any condition the scanner cannot decide keeps both
//! branches.

/// Extract the ordered dependency specifiers of a script source.
pub fn find_all(source: &str) -> Vec<String> {
    Scanner::new(source).scan()
}

/// Extract the ordered `@import` specifiers of a stylesheet source.
pub fn find_css_imports(source: &str) -> Vec<String> {
    let bytes = source.as_bytes();
    let mut specifiers = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        match bytes[pos] {
            b'/' if bytes.get(pos + 1) == Some(&b'*') => {
                pos = skip_block_comment(bytes, pos + 2);
            }
            b'"' | b'\'' => {
                pos = skip_string(bytes, pos + 1, bytes[pos]);
            }
            b'@' if rest_starts_with(bytes, pos + 1, b"import") => {
                pos += 1 + b"import".len();
                pos = skip_css_space(bytes, pos);
                if let Some((spec, next)) = read_css_target(bytes, pos) {
                    if !spec.is_empty() {
                        specifiers.push(spec);
                    }
                    pos = next;
                }
            }
            _ => pos += 1,
        }
    }
    specifiers
}

/// One statically-gated `{ ... }` block.
struct Gate {
    /// Brace depth at which the block opened.
    depth: u32,
    /// Whether specifiers inside the block are collected.
    collecting: bool,
    /// Condition value of the owning `if`, when statically known.
    condition: Option<bool>,
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
    depth: u32,
    gates: Vec<Gate>,
    specifiers: Vec<String>,
}

impl<'a> Scanner<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            bytes: source.as_bytes(),
            pos: 0,
            depth: 0,
            gates: Vec::new(),
            specifiers: Vec::new(),
        }
    }

    fn scan(mut self) -> Vec<String> {
        while self.pos < self.bytes.len() {
            let byte = self.bytes[self.pos];
            match byte {
                b'/' => self.slash(),
                b'"' | b'\'' => {
                    self.pos = skip_string(self.bytes, self.pos + 1, byte);
                }
                b'`' => {
                    self.pos = skip_template(self.bytes, self.pos + 1);
                }
                b'{' => {
                    self.depth += 1;
                    self.pos += 1;
                }
                b'}' => {
                    self.depth = self.depth.saturating_sub(1);
                    self.pos += 1;
                    self.close_gate();
                }
                _ if is_ident_start(byte) => self.word(),
                _ => self.pos += 1,
            }
        }
        self.specifiers
    }

    fn collecting(&self) -> bool {
        self.gates.iter().all(|gate| gate.collecting)
    }

    /// `/` starts a comment, a regex literal, or is plain division. Regex
    /// detection keys off the last significant byte: after an operator or
    /// opener a `/` cannot be division.
    fn slash(&mut self) {
        match self.bytes.get(self.pos + 1).copied() {
            Some(b'/') => {
                self.pos = memchr::memchr(b'\n', &self.bytes[self.pos..])
                    .map(|i| self.pos + i + 1)
                    .unwrap_or(self.bytes.len());
            }
            Some(b'*') => {
                self.pos = skip_block_comment(self.bytes, self.pos + 2);
            }
            _ if self.regex_position() => {
                self.pos = skip_regex(self.bytes, self.pos + 1);
            }
            _ => self.pos += 1,
        }
    }

    fn regex_position(&self) -> bool {
        let mut i = self.pos;
        while i > 0 {
            i -= 1;
            let byte = self.bytes[i];
            if byte == b' ' || byte == b'\t' || byte == b'\n' || byte == b'\r' {
                continue;
            }
            return matches!(
                byte,
                b'=' | b'(' | b',' | b':' | b'[' | b'!' | b'&' | b'|' | b'?' | b'{' | b'}' | b';'
            );
        }
        true
    }

    fn word(&mut self) {
        let start = self.pos;
        while self.pos < self.bytes.len() && is_ident_part(self.bytes[self.pos]) {
            self.pos += 1;
        }
        let word = &self.bytes[start..self.pos];

        // Property access like `foo.require(...)` is not a dependency.
        let preceded_by_dot = start > 0 && self.bytes[start - 1] == b'.';
        if preceded_by_dot {
            return;
        }

        match word {
            b"require" => self.require_call(),
            b"import" => self.import_form(),
            b"if" => self.if_statement(),
            _ => {}
        }
    }

    /// `require("spec")`, tolerating whitespace around the argument.
    fn require_call(&mut self) {
        let mut pos = self.skip_trivia(self.pos);
        if self.bytes.get(pos) != Some(&b'(') {
            return;
        }
        pos = self.skip_trivia(pos + 1);
        if let Some((spec, next)) = read_string(self.bytes, pos) {
            if self.collecting() {
                self.specifiers.push(spec);
            }
            self.pos = next;
        }
    }

    /// Any of the import forms: side-effect `import "spec"`, dynamic
    /// `import("spec")`, and declarations ending in `from "spec"`.
    fn import_form(&mut self) {
        let mut pos = self.skip_trivia(self.pos);
        match self.bytes.get(pos).copied() {
            Some(b'"') | Some(b'\'') => {
                if let Some((spec, next)) = read_string(self.bytes, pos) {
                    if self.collecting() {
                        self.specifiers.push(spec);
                    }
                    self.pos = next;
                }
            }
            Some(b'(') => {
                pos = self.skip_trivia(pos + 1);
                if let Some((spec, next)) = read_string(self.bytes, pos) {
                    if self.collecting() {
                        self.specifiers.push(spec);
                    }
                    self.pos = next;
                }
            }
            _ => self.import_declaration(pos),
        }
    }

    /// Scan past the binding list of an import declaration up to its
    /// `from "spec"` clause. Aborts at `;` or any sign the statement ended.
    fn import_declaration(&mut self, mut pos: usize) {
        let mut brace_depth = 0u32;
        while pos < self.bytes.len() {
            pos = self.skip_trivia(pos);
            match self.bytes.get(pos).copied() {
                Some(b'{') => {
                    brace_depth += 1;
                    pos += 1;
                }
                Some(b'}') => {
                    brace_depth = brace_depth.saturating_sub(1);
                    pos += 1;
                }
                Some(b';') => break,
                Some(byte) if is_ident_start(byte) => {
                    let word_start = pos;
                    while pos < self.bytes.len() && is_ident_part(self.bytes[pos]) {
                        pos += 1;
                    }
                    let word = &self.bytes[word_start..pos];
                    if word == b"from" && brace_depth == 0 {
                        pos = self.skip_trivia(pos);
                        if let Some((spec, next)) = read_string(self.bytes, pos) {
                            if self.collecting() {
                                self.specifiers.push(spec);
                            }
                            self.pos = next;
                            return;
                        }
                        break;
                    }
                    // A second `import` or other statement keyword means the
                    // declaration never had a source clause.
                    if word == b"import" || word == b"var" || word == b"const" || word == b"let" {
                        break;
                    }
                }
                Some(b',') | Some(b'*') => pos += 1,
                _ => break,
            }
        }
        self.pos = pos.max(self.pos + 1).min(self.bytes.len());
    }

    /// `if ("LIT" == "LIT") { ... } else { ... }` static gating.
    fn if_statement(&mut self) {
        let mut pos = self.skip_trivia(self.pos);
        if self.bytes.get(pos) != Some(&b'(') {
            return;
        }
        let (condition_end, condition) = self.read_condition(pos);
        pos = self.skip_trivia(condition_end);
        if self.bytes.get(pos) == Some(&b'{') {
            self.pos = pos + 1;
            self.depth += 1;
            let reachable = condition != Some(false);
            self.gates.push(Gate {
                depth: self.depth - 1,
                collecting: reachable,
                condition,
            });
        } else if condition == Some(false) {
            // Unbraced dead branch: skip the single statement.
            self.pos = skip_statement(self.bytes, pos);
        } else {
            self.pos = pos;
        }
    }

    /// Read a parenthesized condition, returning the position past `)` and
    /// the statically evaluated value when the condition is a literal
    /// string comparison.
    fn read_condition(&self, open: usize) -> (usize, Option<bool>) {
        let mut pos = open + 1;
        let mut paren_depth = 1u32;
        let start = pos;
        while pos < self.bytes.len() && paren_depth > 0 {
            match self.bytes[pos] {
                b'(' => {
                    paren_depth += 1;
                    pos += 1;
                }
                b')' => {
                    paren_depth -= 1;
                    pos += 1;
                }
                b'"' | b'\'' => pos = skip_string(self.bytes, pos + 1, self.bytes[pos]),
                _ => pos += 1,
            }
        }
        let end = pos.saturating_sub(1).max(start);
        let condition = evaluate_condition(&self.bytes[start..end]);
        (pos, condition)
    }

    /// On `}`, pop a gate opened at this depth and handle a trailing
    /// `else` / `else if` chain.
    fn close_gate(&mut self) {
        match self.gates.last() {
            Some(last) if last.depth == self.depth => {}
            _ => return,
        }
        let Some(gate) = self.gates.pop() else {
            return;
        };

        // An `else` branch is reachable unless the `if` was statically true.
        let else_reachable = gate.condition != Some(true);
        let mut pos = self.skip_trivia(self.pos);
        if !rest_is_word(self.bytes, pos, b"else") {
            return;
        }
        pos = self.skip_trivia(pos + b"else".len());

        if rest_is_word(self.bytes, pos, b"if") {
            pos = self.skip_trivia(pos + b"if".len());
            if self.bytes.get(pos) != Some(&b'(') {
                return;
            }
            let (condition_end, condition) = self.read_condition(pos);
            pos = self.skip_trivia(condition_end);
            let combined = if !else_reachable {
                Some(false)
            } else {
                condition
            };
            if self.bytes.get(pos) == Some(&b'{') {
                self.pos = pos + 1;
                self.depth += 1;
                self.gates.push(Gate {
                    depth: self.depth - 1,
                    collecting: combined != Some(false),
                    condition: combined,
                });
            } else if combined == Some(false) {
                self.pos = skip_statement(self.bytes, pos);
            } else {
                self.pos = pos;
            }
        } else if self.bytes.get(pos) == Some(&b'{') {
            self.pos = pos + 1;
            self.depth += 1;
            self.gates.push(Gate {
                depth: self.depth - 1,
                collecting: else_reachable,
                condition: Some(else_reachable),
            });
        } else if !else_reachable {
            self.pos = skip_statement(self.bytes, pos);
        }
    }

    /// Position after whitespace and comments starting at `pos`.
    fn skip_trivia(&self, mut pos: usize) -> usize {
        loop {
            while pos < self.bytes.len() && self.bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            if pos + 1 < self.bytes.len() && self.bytes[pos] == b'/' {
                match self.bytes[pos + 1] {
                    b'/' => {
                        pos = memchr::memchr(b'\n', &self.bytes[pos..])
                            .map(|i| pos + i + 1)
                            .unwrap_or(self.bytes.len());
                        continue;
                    }
                    b'*' => {
                        pos = skip_block_comment(self.bytes, pos + 2);
                        continue;
                    }
                    _ => {}
                }
            }
            return pos;
        }
    }
}

/// Evaluate `"LIT" == "LIT"` and its `!=` / `===` / `!==` variants.
fn evaluate_condition(condition: &[u8]) -> Option<bool> {
    let mut pos = 0;
    while pos < condition.len() && condition[pos].is_ascii_whitespace() {
        pos += 1;
    }
    let (left, next) = read_string(condition, pos)?;
    pos = next;
    while pos < condition.len() && condition[pos].is_ascii_whitespace() {
        pos += 1;
    }

    let negated = match condition.get(pos).copied() {
        Some(b'=') => false,
        Some(b'!') => true,
        _ => return None,
    };
    pos += 1;
    let mut equals = 0;
    while condition.get(pos) == Some(&b'=') {
        equals += 1;
        pos += 1;
    }
    if equals == 0 || equals > 2 {
        return None;
    }

    while pos < condition.len() && condition[pos].is_ascii_whitespace() {
        pos += 1;
    }
    let (right, next) = read_string(condition, pos)?;
    pos = next;
    while pos < condition.len() && condition[pos].is_ascii_whitespace() {
        pos += 1;
    }
    if pos != condition.len() {
        return None;
    }

    Some((left == right) != negated)
}

/// Read a quoted string at `pos`, returning its contents and the position
/// past the closing quote.
fn read_string(bytes: &[u8], pos: usize) -> Option<(String, usize)> {
    let quote = *bytes.get(pos)?;
    if quote != b'"' && quote != b'\'' {
        return None;
    }
    let mut end = pos + 1;
    let mut value = Vec::new();
    while end < bytes.len() {
        match bytes[end] {
            b'\\' if end + 1 < bytes.len() => {
                value.push(bytes[end + 1]);
                end += 2;
            }
            byte if byte == quote => {
                return Some((String::from_utf8_lossy(&value).into_owned(), end + 1));
            }
            b'\n' => return None,
            byte => {
                value.push(byte);
                end += 1;
            }
        }
    }
    None
}

/// Position past the closing quote, or end of input for an unterminated
/// string. Strings do not span lines.
fn skip_string(bytes: &[u8], mut pos: usize, quote: u8) -> usize {
    while pos < bytes.len() {
        match bytes[pos] {
            b'\\' => pos += 2,
            b'\n' => return pos + 1,
            byte if byte == quote => return pos + 1,
            _ => pos += 1,
        }
    }
    bytes.len()
}

/// Position past the closing backtick, honoring `${ ... }` holes (strings
/// inside holes are skipped so a stray backtick in them cannot end the
/// template).
fn skip_template(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() {
        match bytes[pos] {
            b'\\' => pos += 2,
            b'`' => return pos + 1,
            b'$' if bytes.get(pos + 1) == Some(&b'{') => {
                pos += 2;
                let mut hole_depth = 1u32;
                while pos < bytes.len() && hole_depth > 0 {
                    match bytes[pos] {
                        b'{' => {
                            hole_depth += 1;
                            pos += 1;
                        }
                        b'}' => {
                            hole_depth -= 1;
                            pos += 1;
                        }
                        b'"' | b'\'' => pos = skip_string(bytes, pos + 1, bytes[pos]),
                        b'`' => pos = skip_template(bytes, pos + 1),
                        _ => pos += 1,
                    }
                }
            }
            _ => pos += 1,
        }
    }
    bytes.len()
}

/// Position past the closing `*/`, or end of input.
fn skip_block_comment(bytes: &[u8], pos: usize) -> usize {
    let mut i = pos;
    while i + 1 < bytes.len() {
        if bytes[i] == b'*' && bytes[i + 1] == b'/' {
            return i + 2;
        }
        i += 1;
    }
    bytes.len()
}

/// Position past the closing `/` of a regex literal, honoring character
/// classes and escapes. A newline aborts (it was division after all).
fn skip_regex(bytes: &[u8], mut pos: usize) -> usize {
    let mut in_class = false;
    while pos < bytes.len() {
        match bytes[pos] {
            b'\\' => pos += 2,
            b'[' => {
                in_class = true;
                pos += 1;
            }
            b']' => {
                in_class = false;
                pos += 1;
            }
            b'/' if !in_class => return pos + 1,
            b'\n' => return pos,
            _ => pos += 1,
        }
    }
    bytes.len()
}

/// Position past the next `;` at the current nesting level, or past the
/// next closing brace of an enclosing block.
fn skip_statement(bytes: &[u8], mut pos: usize) -> usize {
    let mut brace_depth = 0u32;
    while pos < bytes.len() {
        match bytes[pos] {
            b'"' | b'\'' => pos = skip_string(bytes, pos + 1, bytes[pos]),
            b'`' => pos = skip_template(bytes, pos + 1),
            b'{' => {
                brace_depth += 1;
                pos += 1;
            }
            b'}' => {
                if brace_depth == 0 {
                    return pos;
                }
                brace_depth -= 1;
                pos += 1;
            }
            b';' if brace_depth == 0 => return pos + 1,
            _ => pos += 1,
        }
    }
    bytes.len()
}

fn is_ident_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_' || byte == b'$'
}

fn is_ident_part(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'$'
}

fn rest_starts_with(bytes: &[u8], pos: usize, word: &[u8]) -> bool {
    bytes.len() >= pos + word.len() && &bytes[pos..pos + word.len()] == word
}

/// Like `rest_starts_with` but requires a word boundary after the match.
fn rest_is_word(bytes: &[u8], pos: usize, word: &[u8]) -> bool {
    rest_starts_with(bytes, pos, word)
        && bytes
            .get(pos + word.len())
            .map(|&b| !is_ident_part(b))
            .unwrap_or(true)
}

fn skip_css_space(bytes: &[u8], mut pos: usize) -> usize {
    loop {
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if pos + 1 < bytes.len() && bytes[pos] == b'/' && bytes[pos + 1] == b'*' {
            pos = skip_block_comment(bytes, pos + 2);
            continue;
        }
        return pos;
    }
}

/// `"spec"`, `'spec'` or `url(spec)` after `@import`.
fn read_css_target(bytes: &[u8], pos: usize) -> Option<(String, usize)> {
    match *bytes.get(pos)? {
        b'"' | b'\'' => read_string(bytes, pos),
        b'u' if rest_starts_with(bytes, pos, b"url") => {
            let mut inner = skip_css_space(bytes, pos + 3);
            if bytes.get(inner) != Some(&b'(') {
                return None;
            }
            inner = skip_css_space(bytes, inner + 1);
            if let Some(&quote) = bytes.get(inner) {
                if quote == b'"' || quote == b'\'' {
                    let (spec, next) = read_string(bytes, inner)?;
                    let close = memchr::memchr(b')', &bytes[next..])?;
                    return Some((spec, next + close + 1));
                }
            }
            let close = memchr::memchr(b')', &bytes[inner..])?;
            let spec = String::from_utf8_lossy(&bytes[inner..inner + close])
                .trim()
                .to_string();
            Some((spec, inner + close + 1))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_require_calls() {
        let source = r#"
            const yen = require('yen');
            var home = require("./home_dep.js");
        "#;
        assert_eq!(find_all(source), vec!["yen", "./home_dep.js"]);
    }

    #[test]
    fn finds_import_declarations() {
        let source = r#"
            import './effects.js';
            import React from 'react';
            import * as util from "./util";
            import { a, b } from './named';
            import def, { c } from './mixed';
        "#;
        assert_eq!(
            find_all(source),
            vec!["./effects.js", "react", "./util", "./named", "./mixed"]
        );
    }

    #[test]
    fn finds_multiline_named_import() {
        let source = "import {\n  first,\n  second,\n} from './long';\n";
        assert_eq!(find_all(source), vec!["./long"]);
    }

    #[test]
    fn finds_dynamic_import() {
        assert_eq!(find_all("import('./lazy.js')"), vec!["./lazy.js"]);
    }

    #[test]
    fn mixed_require_and_import() {
        let source = "import a from './a';\nconst b = require('./b');\n";
        assert_eq!(find_all(source), vec!["./a", "./b"]);
    }

    #[test]
    fn ignores_strings_and_comments() {
        let source = r#"
            // require('./line-comment')
            /* require('./block-comment') */
            var s = "require('./in-string')";
            var t = 'import x from "./in-single"';
            var u = `require('./in-template')`;
            require('./real');
        "#;
        assert_eq!(find_all(source), vec!["./real"]);
    }

    #[test]
    fn ignores_template_holes_with_strings() {
        let source = "var s = `a ${ '`' + \"require('x')\" } b`;\nrequire('./after');";
        assert_eq!(find_all(source), vec!["./after"]);
    }

    #[test]
    fn ignores_property_access() {
        assert_eq!(find_all("loader.require('./not-a-dep')"), Vec::<String>::new());
    }

    #[test]
    fn ignores_regex_literals() {
        let source = "var re = /['\"]/; require('./after-regex');";
        assert_eq!(find_all(source), vec!["./after-regex"]);
    }

    #[test]
    fn static_false_branch_is_skipped() {
        let source = r#"
            if ("production" == "development") {
                require('./dev-only');
            }
            require('./always');
        "#;
        assert_eq!(find_all(source), vec!["./always"]);
    }

    #[test]
    fn static_true_branch_is_kept_and_else_dropped() {
        let source = r#"
            if ("a" == "a") {
                require('./then');
            } else {
                require('./else');
            }
        "#;
        assert_eq!(find_all(source), vec!["./then"]);
    }

    #[test]
    fn negated_comparison() {
        let source = r#"
            if ("a" != "b") { require('./kept'); }
            if ("a" !== "a") { require('./dropped'); }
        "#;
        assert_eq!(find_all(source), vec!["./kept"]);
    }

    #[test]
    fn unknown_condition_keeps_both_branches() {
        let source = r#"
            if (process.env.NODE_ENV == "production") {
                require('./prod');
            } else {
                require('./dev');
            }
        "#;
        assert_eq!(find_all(source), vec!["./prod", "./dev"]);
    }

    #[test]
    fn else_if_chain() {
        let source = r#"
            if ("a" == "b") {
                require('./first');
            } else if ("c" == "c") {
                require('./second');
            } else {
                require('./third');
            }
        "#;
        assert_eq!(find_all(source), vec!["./second"]);
    }

    #[test]
    fn unbraced_dead_branch() {
        let source = "if (\"a\" == \"b\") require('./dead');\nrequire('./live');";
        assert_eq!(find_all(source), vec!["./live"]);
    }

    #[test]
    fn nested_gates() {
        let source = r#"
            if ("x" == "x") {
                if ("y" == "z") {
                    require('./never');
                }
                require('./inner');
            }
        "#;
        assert_eq!(find_all(source), vec!["./inner"]);
    }

    #[test]
    fn adversarial_inputs_terminate() {
        // Unbalanced quote inside a comment, unterminated template,
        // unterminated block comment.
        for source in [
            "/* it's fine",
            "var a = `unterminated ${",
            "require('./x'); /* \" */ require('./y');",
            "\"unterminated",
        ] {
            let _ = find_all(source);
        }
        assert_eq!(
            find_all("require('./x'); /* \" */ require('./y');"),
            vec!["./x", "./y"]
        );
    }

    #[test]
    fn css_imports() {
        let source = r#"
            @import "./base.css";
            @import url(reset.css);
            @import url("./quoted.css");
            /* @import "./commented.css"; */
            .rule { background: url(image.png); }
        "#;
        assert_eq!(
            find_css_imports(source),
            vec!["./base.css", "reset.css", "./quoted.css"]
        );
    }

    #[test]
    fn css_matcher_does_not_react_to_js() {
        assert_eq!(find_css_imports("require('./x')"), Vec::<String>::new());
    }

    #[test]
    fn js_matcher_does_not_react_to_css() {
        assert_eq!(find_all("@import \"./base.css\";"), Vec::<String>::new());
    }
}
