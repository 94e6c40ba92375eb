use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::models::{Course, GradeReport};
use crate::utils::watcher::SnapshotSource;

const REST_PATH: &str = "webservice/rest/server.php";

#[derive(Debug, Deserialize)]
struct MoodleCourse {
    id: i64,
    fullname: String,
    #[serde(default)]
    hidden: bool,
}

/// Moodle web-service client authenticated with a user token.
pub struct MoodleClient {
    client: Client,
    endpoint: Url,
    token: String,
    userid: Option<i64>,
}

impl MoodleClient {
    pub fn new(base_url: &Url, token: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build the client")?;

        // Sites may live under a sub-path, which `join` would drop without a trailing slash.
        let mut base = base_url.clone();
        base.path_segments_mut()
            .map_err(|_| anyhow!("Moodle url {} cannot be a base", base_url))?
            .pop_if_empty()
            .push("");
        let endpoint = base
            .join(REST_PATH)
            .with_context(|| format!("Invalid Moodle url {}", base_url))?;

        Ok(Self {
            client,
            endpoint,
            token,
            userid: None,
        })
    }

    // Calls a web-service function and returns its JSON body.
    async fn request(&self, function: &str, args: &[(&str, String)]) -> Result<Value> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("moodlewsrestformat", "json")
            .append_pair("wsfunction", function);

        let mut form: Vec<(&str, String)> = vec![
            ("moodlewssettingfilter", "true".to_string()),
            ("moodlewssettingfileurl", "false".to_string()),
            ("wsfunction", function.to_string()),
            ("wstoken", self.token.clone()),
        ];
        form.extend(args.iter().cloned());

        let body = self
            .client
            .post(url)
            .form(&form)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", function))?
            .error_for_status()
            .with_context(|| format!("Moodle rejected {} request", function))?
            .text()
            .await
            .context("Failed to read response text")?;

        if body.contains("Invalid token") {
            bail!("Invalid Moodle token, check your credentials and try again.");
        }

        let value: Value = serde_json::from_str(&body)
            .with_context(|| format!("Malformed {} response", function))?;
        check_error(function, &value)?;

        Ok(value)
    }

    // Cached after the first site info call.
    async fn user_id(&mut self) -> Result<i64> {
        if let Some(userid) = self.userid {
            return Ok(userid);
        }

        let info = self.request("core_webservice_get_site_info", &[]).await?;
        let userid = info
            .get("userid")
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow!("Site info has no userid"))?;
        self.userid = Some(userid);
        Ok(userid)
    }

    // Enrolled courses, hidden ones included.
    async fn courses(&self, userid: i64) -> Result<Vec<MoodleCourse>> {
        let courses = self
            .request("core_enrol_get_users_courses", &[("userid", userid.to_string())])
            .await?;
        serde_json::from_value(courses).context("Failed to parse courses")
    }

    // Fetches and parses the user report of one course.
    async fn course_grades(&self, userid: i64, course_id: i64) -> Result<Vec<GradeReport>> {
        let table = self
            .request(
                "gradereport_user_get_grades_table",
                &[
                    ("userid", userid.to_string()),
                    ("courseid", course_id.to_string()),
                ],
            )
            .await?;
        parse_grade_table(&table)
    }
}

impl SnapshotSource for MoodleClient {
    async fn fetch_snapshot(&mut self) -> Result<Vec<Course>> {
        let userid = self.user_id().await?;
        let mut snapshot = Vec::new();

        for course in self.courses(userid).await? {
            if course.hidden {
                debug!("Skipping hidden course {:?}", course.fullname);
                continue;
            }

            let grades = self
                .course_grades(userid, course.id)
                .await
                .with_context(|| {
                    format!("Failed to get course grades for {:?}", course.fullname)
                })?;
            snapshot.push(Course {
                id: course.id,
                fullname: course.fullname,
                hidden: false,
                grades,
            });
        }

        info!("Retrieved grades of {} courses", snapshot.len());
        Ok(snapshot)
    }
}

// Moodle reports failures as a JSON object carrying `exception` or `errorcode`,
// often with a 200 status.
fn check_error(function: &str, value: &Value) -> Result<()> {
    let Some(code) = value.get("exception").or_else(|| value.get("errorcode")) else {
        return Ok(());
    };
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    bail!("{} failed with {}: {}", function, code, message)
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("Bad selector {:?}: {:?}", css, e))
}

// Raw HTML content of a table cell, empty when the column is absent.
fn cell<'a>(row: &'a Value, column: &str) -> &'a str {
    row.get(column)
        .and_then(|c| c.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

// Visible text of a cell with the markup stripped.
fn cell_text(row: &Value, column: &str) -> String {
    Html::parse_fragment(cell(row, column))
        .root_element()
        .text()
        .collect::<String>()
        .trim()
        .to_string()
}

/// Extracts the grade rows of a `gradereport_user_get_grades_table` response.
///
/// Category headers, spacers and rows without a grade item id are skipped.
pub fn parse_grade_table(table: &Value) -> Result<Vec<GradeReport>> {
    let rows = match table.pointer("/tables/0/tabledata").and_then(Value::as_array) {
        Some(rows) => rows,
        None => return Ok(Vec::new()),
    };

    let header = selector(".gradeitemheader")?;
    let id_pattern = Regex::new(r"_(\d+)_").context("Failed to compile id pattern")?;

    let mut reports = Vec::new();
    for row in rows {
        let itemname = Html::parse_fragment(cell(row, "itemname"));
        let Some(item) = itemname.select(&header).next() else {
            continue;
        };

        let title = match item.value().attr("title") {
            Some(title) => title.trim().to_string(),
            None => item.text().collect::<String>().trim().to_string(),
        };
        if title.is_empty() {
            continue;
        }

        let raw_id = row
            .get("itemname")
            .and_then(|c| c.get("id"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let id = match id_pattern
            .captures(raw_id)
            .and_then(|c| c[1].parse::<i64>().ok())
        {
            Some(id) => id,
            None => {
                warn!("Skipping grade row {:?} with unexpected id {:?}", title, raw_id);
                continue;
            }
        };

        reports.push(GradeReport {
            id,
            title,
            grade: cell_text(row, "grade"),
            percentage: cell_text(row, "percentage"),
            feedback: cell_text(row, "feedback").replace('\u{a0}', " ").trim().to_string(),
            contribution: cell_text(row, "contributiontocoursetotal"),
            range: cell_text(row, "range").replace('\u{2013}', "-"),
            weight: cell_text(row, "weight"),
        });
    }

    Ok(reports)
}
