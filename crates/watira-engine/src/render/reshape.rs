//! Arabic shaping and visual reordering for renderers without a text
//! shaping engine.
//!
//! Letters are replaced by their contextual presentation forms (isolated,
//! final, initial, medial), lam-alef pairs become ligatures, and runs are
//! reordered right to left. The output is meant to be drawn strictly left to
//! right.

/// Presentation forms: (letter, first form, number of forms). Forms follow
/// the order isolated, final, initial, medial; two-form letters never join
/// the following letter.
const FORMS: &[(char, u32, u8)] = &[
    ('\u{0621}', 0xFE80, 1),
    ('\u{0622}', 0xFE81, 2),
    ('\u{0623}', 0xFE83, 2),
    ('\u{0624}', 0xFE85, 2),
    ('\u{0625}', 0xFE87, 2),
    ('\u{0626}', 0xFE89, 4),
    ('\u{0627}', 0xFE8D, 2),
    ('\u{0628}', 0xFE8F, 4),
    ('\u{0629}', 0xFE93, 2),
    ('\u{062A}', 0xFE95, 4),
    ('\u{062B}', 0xFE99, 4),
    ('\u{062C}', 0xFE9D, 4),
    ('\u{062D}', 0xFEA1, 4),
    ('\u{062E}', 0xFEA5, 4),
    ('\u{062F}', 0xFEA9, 2),
    ('\u{0630}', 0xFEAB, 2),
    ('\u{0631}', 0xFEAD, 2),
    ('\u{0632}', 0xFEAF, 2),
    ('\u{0633}', 0xFEB1, 4),
    ('\u{0634}', 0xFEB5, 4),
    ('\u{0635}', 0xFEB9, 4),
    ('\u{0636}', 0xFEBD, 4),
    ('\u{0637}', 0xFEC1, 4),
    ('\u{0638}', 0xFEC5, 4),
    ('\u{0639}', 0xFEC9, 4),
    ('\u{063A}', 0xFECD, 4),
    ('\u{0641}', 0xFED1, 4),
    ('\u{0642}', 0xFED5, 4),
    ('\u{0643}', 0xFED9, 4),
    ('\u{0644}', 0xFEDD, 4),
    ('\u{0645}', 0xFEE1, 4),
    ('\u{0646}', 0xFEE5, 4),
    ('\u{0647}', 0xFEE9, 4),
    ('\u{0648}', 0xFEED, 2),
    ('\u{0649}', 0xFEEF, 2),
    ('\u{064A}', 0xFEF1, 4),
];

const LAM: char = '\u{0644}';
const TATWEEL: char = '\u{0640}';

/// Lam followed by an alef variant: (alef, isolated ligature). The final
/// form is the next code point.
const LAM_ALEF: &[(char, u32)] = &[
    ('\u{0622}', 0xFEF5),
    ('\u{0623}', 0xFEF7),
    ('\u{0625}', 0xFEF9),
    ('\u{0627}', 0xFEFB),
];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Form {
    Isolated,
    Final,
    Initial,
    Medial,
}

fn forms_of(c: char) -> Option<(u32, u8)> {
    FORMS
        .binary_search_by_key(&c, |(letter, _, _)| *letter)
        .ok()
        .map(|i| (FORMS[i].1, FORMS[i].2))
}

/// Whether `c` connects to the letter after it.
fn joins_forward(c: char) -> bool {
    c == TATWEEL || matches!(forms_of(c), Some((_, 4)))
}

/// Whether `c` connects to the letter before it.
fn joins_backward(c: char) -> bool {
    c == TATWEEL || matches!(forms_of(c), Some((_, n)) if n >= 2)
}

fn is_harakat(c: char) -> bool {
    matches!(c, '\u{064B}'..='\u{065F}' | '\u{0670}')
}

fn is_arabic(c: char) -> bool {
    matches!(c, '\u{0600}'..='\u{06FF}' | '\u{0750}'..='\u{077F}' | '\u{FB50}'..='\u{FDFF}' | '\u{FE70}'..='\u{FEFF}')
}

fn present(c: char, form: Form) -> char {
    let Some((base, count)) = forms_of(c) else {
        return c;
    };
    let offset = match (form, count) {
        (_, 1) => 0,
        (Form::Isolated, _) => 0,
        (Form::Final, _) => 1,
        // Two-form letters have no initial or medial shape.
        (Form::Initial, 2) => 0,
        (Form::Medial, 2) => 1,
        (Form::Initial, _) => 2,
        (Form::Medial, _) => 3,
    };
    char::from_u32(base + offset).unwrap_or(c)
}

/// Replace Arabic letters with contextual presentation forms. Diacritics are
/// dropped. Text without Arabic letters is returned unchanged.
pub fn reshape(text: &str) -> String {
    if !text.chars().any(|c| forms_of(c).is_some()) {
        return text.to_string();
    }
    let chars: Vec<char> = text.chars().filter(|c| !is_harakat(*c)).collect();
    let mut out = String::with_capacity(text.len());

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let prev_joins = i > 0 && joins_forward(chars[i - 1]);

        if c == LAM {
            if let Some(&(_, ligature)) = chars
                .get(i + 1)
                .and_then(|next| LAM_ALEF.iter().find(|(alef, _)| alef == next))
            {
                let code = if prev_joins { ligature + 1 } else { ligature };
                out.push(char::from_u32(code).unwrap_or(c));
                i += 2;
                continue;
            }
        }

        if forms_of(c).is_none() {
            out.push(c);
            i += 1;
            continue;
        }

        let prev = prev_joins && joins_backward(c);
        let next = joins_forward(c) && chars.get(i + 1).is_some_and(|n| joins_backward(*n));
        let form = match (prev, next) {
            (true, true) => Form::Medial,
            (true, false) => Form::Final,
            (false, true) => Form::Initial,
            (false, false) => Form::Isolated,
        };
        out.push(present(c, form));
        i += 1;
    }
    out
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Direction {
    Rtl,
    Ltr,
    Neutral,
}

fn direction_of(c: char) -> Direction {
    if is_arabic(c) {
        Direction::Rtl
    } else if c.is_alphanumeric() {
        Direction::Ltr
    } else {
        Direction::Neutral
    }
}

fn mirror(c: char) -> char {
    match c {
        '(' => ')',
        ')' => '(',
        '[' => ']',
        ']' => '[',
        '{' => '}',
        '}' => '{',
        '<' => '>',
        '>' => '<',
        '«' => '»',
        '»' => '«',
        other => other,
    }
}

/// Reorder a right-to-left paragraph into visual (left to right) order.
///
/// Left-to-right runs (Latin words, digits) keep their internal order;
/// neutrals between two of them join the run. Everything else is reversed
/// and brackets are mirrored. Text without Arabic is returned unchanged.
pub fn visual_order(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    if !chars.iter().any(|c| is_arabic(*c)) {
        return text.to_string();
    }

    let mut dirs: Vec<Direction> = chars.iter().map(|c| direction_of(*c)).collect();
    let mut i = 0;
    while i < dirs.len() {
        if dirs[i] != Direction::Neutral {
            i += 1;
            continue;
        }
        let start = i;
        while i < dirs.len() && dirs[i] == Direction::Neutral {
            i += 1;
        }
        let before = start.checked_sub(1).map(|j| dirs[j]);
        let after = dirs.get(i).copied();
        let resolved = if before == Some(Direction::Ltr) && after == Some(Direction::Ltr) {
            Direction::Ltr
        } else {
            Direction::Rtl
        };
        for d in &mut dirs[start..i] {
            *d = resolved;
        }
    }

    let mut runs: Vec<(Direction, Vec<char>)> = Vec::new();
    for (c, d) in chars.into_iter().zip(dirs) {
        match runs.last_mut() {
            Some((dir, run)) if *dir == d => run.push(c),
            _ => runs.push((d, vec![c])),
        }
    }

    let mut out = String::with_capacity(text.len());
    for (dir, run) in runs.into_iter().rev() {
        match dir {
            Direction::Ltr => out.extend(run),
            _ => out.extend(run.into_iter().rev().map(mirror)),
        }
    }
    out
}

/// Shape then reorder, ready for left-to-right drawing.
pub fn shape_for_display(text: &str) -> String {
    visual_order(&reshape(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted_for_lookup() {
        assert!(FORMS.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn latin_text_untouched() {
        assert_eq!(shape_for_display("Quarterly sales (2024)"), "Quarterly sales (2024)");
    }

    #[test]
    fn isolated_letter() {
        assert_eq!(reshape("ب"), "\u{FE8F}");
    }

    #[test]
    fn contextual_forms() {
        // beh + teh + beh: initial, medial, final
        assert_eq!(reshape("بتب"), "\u{FE91}\u{FE98}\u{FE90}");
    }

    #[test]
    fn non_joining_letter_breaks_word() {
        // dal does not join forward: beh(initial) dal(final) beh(isolated)
        assert_eq!(reshape("بدب"), "\u{FE91}\u{FEAA}\u{FE8F}");
    }

    #[test]
    fn lam_alef_ligature() {
        assert_eq!(reshape("لا"), "\u{FEFB}");
        // after a joining letter the ligature takes its final form
        assert_eq!(reshape("بلا"), "\u{FE91}\u{FEFC}");
    }

    #[test]
    fn diacritics_dropped() {
        assert_eq!(reshape("بَ"), "\u{FE8F}");
    }

    #[test]
    fn arabic_run_reversed() {
        let shaped = reshape("بتب");
        let display = visual_order(&shaped);
        assert_eq!(display, "\u{FE90}\u{FE98}\u{FE91}");
    }

    #[test]
    fn embedded_latin_keeps_order() {
        let display = visual_order("ب hello world ت");
        assert_eq!(display, "ت hello world ب");
    }

    #[test]
    fn brackets_mirrored_in_rtl() {
        assert_eq!(visual_order("(ب)"), "(ب)");
    }
}
