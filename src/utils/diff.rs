use std::cmp::Ordering;

use crate::models::{
    ChangeKind, ChangeSet, Course, CourseGradesChange, GradeField, GradeReport, GradeRowChange,
    NOISE_VALUES,
};

/// An element of a merge-join over two id-sorted sequences.
enum Joined<'a, T> {
    Left(&'a T),
    Right(&'a T),
    Both(&'a T, &'a T),
}

// Walks both sides sorted by `key` ascending. The callers' slices are left untouched,
// only private vectors of references are sorted.
fn merge_join<'a, T, F>(left: &'a [T], right: &'a [T], key: F) -> Vec<Joined<'a, T>>
where
    F: Fn(&T) -> i64,
{
    let mut left: Vec<&T> = left.iter().collect();
    let mut right: Vec<&T> = right.iter().collect();
    left.sort_by_key(|item| key(*item));
    right.sort_by_key(|item| key(*item));

    let mut joined = Vec::with_capacity(left.len().max(right.len()));
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        match key(left[i]).cmp(&key(right[j])) {
            Ordering::Less => {
                joined.push(Joined::Left(left[i]));
                i += 1;
            }
            Ordering::Greater => {
                joined.push(Joined::Right(right[j]));
                j += 1;
            }
            Ordering::Equal => {
                joined.push(Joined::Both(left[i], right[j]));
                i += 1;
                j += 1;
            }
        }
    }
    joined.extend(left[i..].iter().map(|item| Joined::Left(*item)));
    joined.extend(right[j..].iter().map(|item| Joined::Right(*item)));
    joined
}

/// Computes the changes between two snapshots of courses.
///
/// Courses are matched by id, then grade rows inside each course are matched by id.
/// A course missing on one side is compared against an empty grade table, so all of
/// its rows show up as created or removed. The result is ordered by course id, then
/// by row id.
///
/// Course ids must be unique within each snapshot and row ids unique within a
/// course; duplicates produce an unspecified pairing.
pub fn compare_courses(old: &[Course], new: &[Course]) -> ChangeSet {
    let mut changes = ChangeSet::new();

    for pair in merge_join(old, new, |course| course.id) {
        let (course, rows) = match pair {
            Joined::Left(removed) => (removed, compare_grade_reports(&removed.grades, &[])),
            Joined::Right(added) => (added, compare_grade_reports(&[], &added.grades)),
            Joined::Both(before, after) => {
                (after, compare_grade_reports(&before.grades, &after.grades))
            }
        };

        if rows.is_empty() {
            continue;
        }

        changes.push(CourseGradesChange {
            course: course.summary(),
            grades_table_change: rows,
        });
    }

    changes
}

/// Compares two grade tables of the same course.
pub fn compare_grade_reports(from: &[GradeReport], to: &[GradeReport]) -> Vec<GradeRowChange> {
    merge_join(from, to, |row| row.id)
        .into_iter()
        .filter_map(|pair| match pair {
            Joined::Left(removed) => Some(GradeRowChange {
                id: removed.id,
                kind: ChangeKind::Removed,
                fields: Vec::new(),
                from: removed.clone(),
                to: GradeReport::default(),
            }),
            Joined::Right(created) => Some(GradeRowChange {
                id: created.id,
                kind: ChangeKind::Created,
                fields: Vec::new(),
                from: GradeReport::default(),
                to: created.clone(),
            }),
            Joined::Both(before, after) => compare_grades(before, after),
        })
        .collect()
}

fn compare_grades(from: &GradeReport, to: &GradeReport) -> Option<GradeRowChange> {
    let fields = field_diff(from, to);
    if fields.is_empty() {
        return None;
    }

    Some(GradeRowChange {
        id: to.id,
        kind: ChangeKind::Updated,
        fields,
        from: from.clone(),
        to: to.clone(),
    })
}

/// Lists the fields that differ between two rows, skipping those whose new value is
/// a noise placeholder.
pub fn field_diff(from: &GradeReport, to: &GradeReport) -> Vec<GradeField> {
    GradeField::ALL
        .into_iter()
        .filter(|field| {
            let new_value = to.field(*field);
            from.field(*field) != new_value && !is_noise(new_value)
        })
        .collect()
}

pub fn is_noise(value: &str) -> bool {
    NOISE_VALUES.contains(&value)
}
