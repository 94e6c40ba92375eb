use anyhow::{bail, Result};

use crate::models::{ChangeKind, CourseGradesChange, GradeField, GradeReport, GradeRowChange};

const TRUNCATION_MARKER: &str = "…";

/// Smallest message size `render` accepts: room for the truncation marker.
pub const MIN_MESSAGE_LEN: usize = TRUNCATION_MARKER.len();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatConfig {
    /// Fields printed for every row.
    pub to_print: Vec<GradeField>,
    /// Fields printed only when they changed.
    pub to_print_on_updates: Vec<GradeField>,
    /// An update is reported only if it touches one of these.
    pub updates_to_check: Vec<GradeField>,
    pub check_creates: bool,
    pub check_removes: bool,
}

/// Turns change sets into notification messages.
#[derive(Debug, Clone)]
pub struct Formatter {
    cfg: FormatConfig,
}

impl Formatter {
    pub fn new(cfg: FormatConfig) -> Self {
        Self { cfg }
    }

    /// Drops rows nobody asked to be told about, then courses left without rows.
    pub fn filter(&self, changes: Vec<CourseGradesChange>) -> Vec<CourseGradesChange> {
        changes
            .into_iter()
            .filter_map(|mut course_change| {
                course_change
                    .grades_table_change
                    .retain(|row| self.is_tracked(row));
                (!course_change.grades_table_change.is_empty()).then_some(course_change)
            })
            .collect()
    }

    // Structural changes follow their flags, updates need a watched field.
    fn is_tracked(&self, row: &GradeRowChange) -> bool {
        match row.kind {
            ChangeKind::Created => self.cfg.check_creates,
            ChangeKind::Removed => self.cfg.check_removes,
            ChangeKind::Updated => row
                .fields
                .iter()
                .any(|field| self.cfg.updates_to_check.contains(field)),
        }
    }

    /// Renders the changes and packs them into messages of at most `max_bytes`.
    ///
    /// Course blocks are packed greedily. A course block that cannot fit in one
    /// message is split between its rows, and a single row that still does not fit
    /// is cut short and ends with `…`.
    pub fn render(&self, changes: &[CourseGradesChange], max_bytes: usize) -> Result<Vec<String>> {
        if max_bytes < MIN_MESSAGE_LEN {
            bail!("Message size limit {} is too small", max_bytes);
        }

        let mut pieces = Vec::new();
        for course_change in changes {
            let block = self.render_course(course_change);
            if block.len() <= max_bytes {
                pieces.push(block);
            } else {
                pieces.extend(
                    self.render_course_rows(course_change)
                        .into_iter()
                        .map(|piece| truncate(piece, max_bytes)),
                );
            }
        }

        Ok(pack(pieces, max_bytes))
    }

    fn render_course(&self, course_change: &CourseGradesChange) -> String {
        self.render_course_rows(course_change).concat()
    }

    // The course title travels with the first row.
    fn render_course_rows(&self, course_change: &CourseGradesChange) -> Vec<String> {
        let mut rows: Vec<String> = course_change
            .grades_table_change
            .iter()
            .map(|row| self.render_row(row))
            .collect();

        let title = format!("{}:\n\n", course_change.course.fullname);
        match rows.first_mut() {
            Some(first) => first.insert_str(0, &title),
            None => rows.push(title),
        }
        rows
    }

    // Kind header, then the always-printed fields and any changed optional ones.
    fn render_row(&self, row: &GradeRowChange) -> String {
        let mut out = String::new();
        match row.kind {
            ChangeKind::Created => out.push_str("New grade\n"),
            ChangeKind::Removed => out.push_str("Removed grade\n"),
            ChangeKind::Updated => {}
        }

        let shown = self.cfg.to_print.iter().chain(
            self.cfg
                .to_print_on_updates
                .iter()
                .filter(|field| !self.cfg.to_print.contains(field) && row.fields.contains(field)),
        );
        for field in shown {
            out.push_str(&render_field(row, *field));
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

// `Field:  "old"  ->  "new"` when it changed, `Field:  "value"` otherwise.
fn render_field(row: &GradeRowChange, field: GradeField) -> String {
    if row.fields.contains(&field) {
        format!("{}:  {:?}  ->  {:?}", field, row.from.field(field), row.to.field(field))
    } else {
        format!("{}:  {:?}", field, current_side(row).field(field))
    }
}

fn current_side(row: &GradeRowChange) -> &GradeReport {
    match row.kind {
        ChangeKind::Removed => &row.from,
        ChangeKind::Created | ChangeKind::Updated => &row.to,
    }
}

// Greedy: start a new message only when the next piece would overflow.
fn pack(pieces: Vec<String>, max_bytes: usize) -> Vec<String> {
    let mut messages = Vec::new();
    let mut buffer = String::new();

    for piece in pieces {
        if !buffer.is_empty() && buffer.len() + piece.len() > max_bytes {
            messages.push(std::mem::take(&mut buffer));
        }
        buffer.push_str(&piece);
    }
    if !buffer.is_empty() {
        messages.push(buffer);
    }

    messages
}

// Cuts on a char boundary and appends the marker.
fn truncate(mut piece: String, max_bytes: usize) -> String {
    if piece.len() <= max_bytes {
        return piece;
    }

    let mut cut = max_bytes - TRUNCATION_MARKER.len();
    while !piece.is_char_boundary(cut) {
        cut -= 1;
    }
    piece.truncate(cut);
    piece.push_str(TRUNCATION_MARKER);
    piece
}
