//! ZIP packaging collaborator: `<student_id>/<page images>` → per-student ordered pages.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::{Component, Path};

use thiserror::Error;
use zip::read::ZipArchive;

const MAX_STUDENT_ID_LEN: usize = 64;

#[derive(Debug, Error)]
pub(crate) enum IngestError {
    #[error("invalid ZIP archive: {0}")]
    InvalidArchive(String),
    #[error("uncompressed archive size exceeds {0} bytes")]
    TooLarge(u64),
    #[error("no student folders found in archive")]
    NoStudents,
}

#[derive(Debug, Clone)]
pub(crate) struct ArchivePage {
    pub(crate) file_name: String,
    pub(crate) bytes: Vec<u8>,
}

/// One student folder. A folder with a `problem` becomes a pre-failed batch entry.
#[derive(Debug, Clone)]
pub(crate) struct StudentPages {
    pub(crate) student_id: String,
    pub(crate) pages: Vec<ArchivePage>,
    pub(crate) problem: Option<String>,
}

pub(crate) fn read_archive(
    bytes: &[u8],
    allowed_extensions: &[String],
    max_uncompressed: u64,
) -> Result<Vec<StudentPages>, IngestError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| IngestError::InvalidArchive(err.to_string()))?;

    let mut members = Vec::new();
    let mut total_uncompressed = 0_u64;
    for index in 0..archive.len() {
        let mut file = match archive.by_index(index) {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!(index, error = %err, "Skipping unreadable archive member");
                continue;
            }
        };

        let Some(path) = file.enclosed_name() else {
            tracing::warn!(name = %file.name(), "Skipping archive member outside extraction root");
            continue;
        };
        let components: Vec<String> = path
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if components.is_empty() || components.iter().any(|part| is_hidden(part)) {
            continue;
        }

        total_uncompressed += file.size();
        if total_uncompressed > max_uncompressed {
            return Err(IngestError::TooLarge(max_uncompressed));
        }

        let content = if file.is_dir() {
            Member::Folder
        } else {
            let mut buffer = Vec::with_capacity(file.size() as usize);
            match file.read_to_end(&mut buffer) {
                Ok(_) => Member::File(buffer),
                Err(err) => Member::Unreadable(err.to_string()),
            }
        };
        members.push((components, content));
    }

    let prefix_len = common_wrapper_len(&members);
    let mut students: BTreeMap<String, StudentPages> = BTreeMap::new();

    for (components, content) in members {
        let components = &components[prefix_len..];
        let Some((folder, rest)) = components.split_first() else {
            continue;
        };
        if rest.is_empty() && !matches!(content, Member::Folder) {
            // Loose file at the archive root.
            continue;
        }

        let student = students.entry(folder.clone()).or_insert_with(|| StudentPages {
            student_id: folder.trim().to_string(),
            pages: Vec::new(),
            problem: None,
        });
        let Some(file_name) = rest.last() else {
            continue;
        };

        match content {
            Member::Folder => {}
            Member::File(bytes) if is_image(file_name, allowed_extensions) => {
                student.pages.push(ArchivePage { file_name: file_name.clone(), bytes });
            }
            Member::File(_) => {}
            Member::Unreadable(reason) => {
                if is_image(file_name, allowed_extensions) {
                    student.problem.get_or_insert(format!("unreadable page {file_name}: {reason}"));
                }
            }
        }
    }

    if students.is_empty() {
        return Err(IngestError::NoStudents);
    }

    let mut result: Vec<StudentPages> = students.into_values().collect();
    for student in &mut result {
        student.pages.sort_by(|left, right| natural_cmp(&left.file_name, &right.file_name));
        if let Err(reason) = validate_student_id(&student.student_id) {
            student.problem = Some(reason);
        } else if student.pages.is_empty() && student.problem.is_none() {
            student.problem = Some("no page images found".to_string());
        }
    }

    Ok(result)
}

enum Member {
    Folder,
    File(Vec<u8>),
    Unreadable(String),
}

fn is_hidden(part: &str) -> bool {
    part.starts_with('.') || part.starts_with("__")
}

fn is_image(file_name: &str, allowed_extensions: &[String]) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| allowed_extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Strips a single folder wrapping every student folder (`batch/S1/p1.jpg`).
fn common_wrapper_len(members: &[(Vec<String>, Member)]) -> usize {
    let files: Vec<&Vec<String>> = members
        .iter()
        .filter(|(_, content)| !matches!(content, Member::Folder))
        .map(|(components, _)| components)
        .collect();
    let Some(first) = files.first() else {
        return 0;
    };
    let wrapper = &first[0];
    let wrapped = files.iter().all(|components| components.len() >= 3 && &components[0] == wrapper);
    usize::from(wrapped)
}

pub(crate) fn validate_student_id(student_id: &str) -> Result<(), String> {
    let trimmed = student_id.trim();
    if trimmed.is_empty() {
        return Err("invalid student id: empty".to_string());
    }
    if trimmed.chars().count() > MAX_STUDENT_ID_LEN {
        return Err(format!("invalid student id '{trimmed}': longer than {MAX_STUDENT_ID_LEN}"));
    }
    if !trimmed.chars().all(|ch| ch.is_alphanumeric() || matches!(ch, '-' | '_' | '.' | ' ')) {
        return Err(format!("invalid student id '{trimmed}'"));
    }
    Ok(())
}

/// File-name order where digit runs compare numerically (`page2` < `page10`).
pub(crate) fn natural_cmp(left: &str, right: &str) -> Ordering {
    let mut left_chars = left.chars().peekable();
    let mut right_chars = right.chars().peekable();

    loop {
        match (left_chars.peek().copied(), right_chars.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(a), Some(b)) if a.is_ascii_digit() && b.is_ascii_digit() => {
                let left_run = take_digits(&mut left_chars);
                let right_run = take_digits(&mut right_chars);
                let left_trimmed = left_run.trim_start_matches('0');
                let right_trimmed = right_run.trim_start_matches('0');
                let ordering = left_trimmed
                    .len()
                    .cmp(&right_trimmed.len())
                    .then_with(|| left_trimmed.cmp(right_trimmed))
                    .then_with(|| left_run.len().cmp(&right_run.len()));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(a), Some(b)) => {
                let ordering = a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase());
                if ordering != Ordering::Equal {
                    return ordering;
                }
                left_chars.next();
                right_chars.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(ch) = chars.peek().copied().filter(char::is_ascii_digit) {
        run.push(ch);
        chars.next();
    }
    run
}
