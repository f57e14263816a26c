// Copyright 2025 the Replete authors. All rights reserved. MIT license.

//! Range-based source editing. Both the REPL-izer and the source server
//! rewrite JavaScript by replacing byte ranges of the original text.
//! Replacements never change the line count: any newlines that a replacement
//! swallows are padded back in, so runtime line numbers keep pointing at the
//! user's source.

use std::ops::Range;

#[derive(Debug, Clone)]
pub struct Alteration {
  pub range: Range<usize>,
  pub replacement: String,
}

impl Alteration {
  pub fn new(range: Range<usize>, replacement: impl Into<String>) -> Self {
    Self {
      range,
      replacement: replacement.into(),
    }
  }

  /// A pure insertion at `position`.
  pub fn insert(position: usize, replacement: impl Into<String>) -> Self {
    Self::new(position..position, replacement)
  }
}

fn count_newlines(text: &str) -> usize {
  text.bytes().filter(|b| *b == b'\n').count()
}

pub fn count_lines(text: &str) -> usize {
  count_newlines(text) + 1
}

/// Apply a set of disjoint alterations to `source`. Alterations may be given
/// in any order. Each replacement is padded with the newlines its range
/// contained, preserving the total line count.
pub fn alter_string(source: &str, mut alterations: Vec<Alteration>) -> String {
  alterations
    .sort_by(|a, b| (a.range.start, a.range.end).cmp(&(b.range.start, b.range.end)));
  let mut altered = String::with_capacity(source.len());
  let mut position = 0;
  for alteration in alterations {
    debug_assert!(
      alteration.range.start >= position,
      "overlapping alterations"
    );
    altered.push_str(&source[position..alteration.range.start]);
    altered.push_str(&alteration.replacement);
    let removed = count_newlines(&source[alteration.range.clone()]);
    let added = count_newlines(&alteration.replacement);
    for _ in added..removed {
      altered.push('\n');
    }
    position = alteration.range.end;
  }
  altered.push_str(&source[position..]);
  altered
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_alter_string() {
    let source = "const x = 1;\nconst y = 2;\n";
    let altered = alter_string(
      source,
      vec![
        Alteration::new(18..19, "z"),
        Alteration::new(0..5, "let"),
      ],
    );
    assert_eq!(altered, "let x = 1;\nconst z = 2;\n");
  }

  #[test]
  fn test_alter_string_preserves_lines() {
    let source = "import {\n  a,\n  b\n} from \"./m.js\";\na();\n";
    let altered = alter_string(source, vec![Alteration::new(0..35, "")]);
    assert_eq!(count_lines(altered.as_str()), count_lines(source));
    assert_eq!(altered, "\n\n\n\na();\n");
  }

  #[test]
  fn test_alter_string_insertions() {
    let source = "{a} = b;";
    let altered = alter_string(
      source,
      vec![
        Alteration::insert(6, "("),
        Alteration::insert(7, ")"),
      ],
    );
    assert_eq!(altered, "{a} = (b);");
  }

  #[test]
  fn test_alter_string_replacement_with_newlines() {
    let source = "one\ntwo\nthree";
    let altered =
      alter_string(source, vec![Alteration::new(0..8, "1\n2\n")]);
    assert_eq!(altered, "1\n2\nthree");
    assert_eq!(count_lines(&altered), count_lines(source));
  }
}
