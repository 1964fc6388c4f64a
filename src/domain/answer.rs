//! Analysis results as stored on the glasses and sent to the backend.

use serde::{Deserialize, Serialize};

/// One analyzed question, written to the glasses as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub question_id: String,
    pub subject: String,
    pub total_questions: usize,
    pub current_index: usize,
    pub analysis_result: String,
}

impl AnalysisResult {
    /// `index` is 1-based.
    pub fn new(subject: &str, index: usize, total: usize, analysis: String) -> Self {
        Self {
            question_id: format!("{}.jpg", index),
            subject: subject.to_string(),
            total_questions: total,
            current_index: index,
            analysis_result: analysis,
        }
    }
}

/// Body posted to the backend for each answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerSubmission {
    pub answer_id: String,
    pub subject: String,
    pub file_name: String,
    pub file_size: usize,
    pub content: String,
    pub device_id: String,
    pub image_index: usize,
    pub total_images: usize,
}

impl AnswerSubmission {
    pub fn new(answer_id: &str, device_id: &str, result: &AnalysisResult) -> anyhow::Result<Self> {
        let content = serde_json::to_string(result)?;
        Ok(Self {
            answer_id: answer_id.to_string(),
            subject: result.subject.clone(),
            file_name: format!("{}.json", answer_id),
            file_size: content.len(),
            content,
            device_id: device_id.to_string(),
            image_index: result.current_index,
            total_images: result.total_questions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_json_shape() {
        let result = AnalysisResult::new("physics", 2, 3, "F = ma".to_string());
        let value = serde_json::to_value(&result).unwrap();

        assert_eq!(value["question_id"], "2.jpg");
        assert_eq!(value["subject"], "physics");
        assert_eq!(value["total_questions"], 3);
        assert_eq!(value["current_index"], 2);
        assert_eq!(value["analysis_result"], "F = ma");
    }

    #[test]
    fn test_submission_wraps_result() {
        let result = AnalysisResult::new("math", 1, 1, "42".to_string());
        let submission = AnswerSubmission::new("a1", "AR_GLASS", &result).unwrap();

        assert_eq!(submission.file_name, "a1.json");
        assert_eq!(submission.file_size, submission.content.len());
        let inner: AnalysisResult = serde_json::from_str(&submission.content).unwrap();
        assert_eq!(inner, result);
    }
}
