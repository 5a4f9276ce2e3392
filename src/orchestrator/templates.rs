use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

use crate::core::error::{ChatError, StorageError};
use crate::storage::KvStore;

pub const USER_TEMPLATES_KEY: &str = "user_prompts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateCategory {
    Writing,
    Creative,
    Professional,
    Learning,
    Coding,
    Personal,
}

impl TemplateCategory {
    pub const ALL: [TemplateCategory; 6] = [
        Self::Writing,
        Self::Creative,
        Self::Professional,
        Self::Learning,
        Self::Coding,
        Self::Personal,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Writing => "Writing",
            Self::Creative => "Creative",
            Self::Professional => "Professional",
            Self::Learning => "Learning",
            Self::Coding => "Coding",
            Self::Personal => "Personal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub title: String,
    pub prompt: String,
    pub category: TemplateCategory,
}

impl PromptTemplate {
    fn new(category: TemplateCategory, title: &str, prompt: &str) -> Self {
        Self {
            title: title.into(),
            prompt: prompt.into(),
            category,
        }
    }

    pub fn placeholders(&self) -> Vec<String> {
        placeholders(&self.prompt)
    }

    pub fn fill(&self, values: &HashMap<String, String>) -> String {
        fill(&self.prompt, values)
    }
}

fn placeholder_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^}]+)\}\}").ok()).as_ref()
}

/// Unique `{{name}}` placeholders in order of first appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let Some(re) = placeholder_re() else {
        return Vec::new();
    };
    let mut names: Vec<String> = Vec::new();
    for cap in re.captures_iter(template) {
        let name = cap[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Substitute every placeholder. Missing or empty values become
/// `[Formatted Name]` so the gap stays visible in the prompt.
pub fn fill(template: &str, values: &HashMap<String, String>) -> String {
    let Some(re) = placeholder_re() else {
        return template.to_string();
    };
    re.replace_all(template, |cap: &regex::Captures<'_>| {
        let name = &cap[1];
        match values.get(name).filter(|v| !v.is_empty()) {
            Some(v) => v.clone(),
            None => format!("[{}]", format_placeholder_name(name)),
        }
    })
    .into_owned()
}

/// `bulletPoints` -> `Bullet Points`.
pub fn format_placeholder_name(name: &str) -> String {
    let mut spaced = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            spaced.push(' ');
        }
        spaced.push(c);
    }

    let mut out = String::with_capacity(spaced.len());
    let mut prev_is_word = false;
    for c in spaced.chars() {
        let is_word = c.is_alphanumeric() || c == '_';
        if is_word && !prev_is_word {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        prev_is_word = is_word;
    }
    out.trim().to_string()
}

/// Built-in templates in display order.
pub fn builtin_templates() -> Vec<(&'static str, PromptTemplate)> {
    use TemplateCategory::*;
    vec![
        ("blogPost", PromptTemplate::new(Writing, "Blog Post",
            "Write a blog post about {{topic}} with the following sections:\n\n1. Introduction that hooks the reader\n2. Main points with supporting evidence\n3. Personal insights and experiences\n4. Actionable takeaways for readers\n5. Compelling conclusion\n\nMake it conversational but informative, around 800-1000 words.")),
        ("essayOutline", PromptTemplate::new(Writing, "Essay Outline",
            "Create a detailed outline for an essay on {{topic}}. Include:\n\n1. A compelling thesis statement\n2. Main arguments with supporting points\n3. Evidence and examples needed\n4. Introduction and conclusion approaches\n5. Potential counterarguments to address")),
        ("emailDraft", PromptTemplate::new(Writing, "Professional Email",
            "Draft a professional email about {{topic}} that is:\n\n1. Clear and concise\n2. Polite and respectful\n3. Well-structured with proper greeting and closing\n4. Free of jargon and unnecessary language\n5. Action-oriented with clear next steps")),
        ("shortStory", PromptTemplate::new(Creative, "Short Story",
            "Write a creative short story with the following elements:\n\n1. Setting: {{setting}}\n2. Main character: {{character}}\n3. Conflict: {{conflict}}\n4. Theme: {{theme}}\n\nMake it engaging with descriptive language and dialogue. Around 800-1000 words.")),
        ("poemGenerator", PromptTemplate::new(Creative, "Poetry",
            "Write a poem about {{topic}} in the style of {{style}} with attention to:\n\n1. Imagery and sensory details\n2. Rhythm and flow\n3. Metaphors and symbolism\n4. Emotional resonance\n\nLength: Approximately 12-16 lines.")),
        ("creativeDescription", PromptTemplate::new(Creative, "Vivid Description",
            "Create an extremely detailed and vivid description of {{subject}} focusing on:\n\n1. Visual details and colors\n2. Sounds and ambient noise\n3. Smells and tastes if applicable\n4. Textures and physical sensations\n5. The emotional atmosphere or feeling\n\nBring this to life using rich sensory language and figurative devices.")),
        ("resumeImprove", PromptTemplate::new(Professional, "Resume Bullet Points",
            "Help me improve these resume bullet points for a {{position}} role. Transform them to:\n\n1. Focus on achievements rather than duties\n2. Include quantifiable results and metrics\n3. Use strong action verbs\n4. Highlight relevant skills\n5. Remove unnecessary jargon\n\nHere are my current bullet points:\n{{bulletPoints}}")),
        ("interviewPrep", PromptTemplate::new(Professional, "Interview Prep",
            "Help me prepare for an interview for a {{position}} position at a {{industry}} company. Provide:\n\n1. 5 common interview questions for this role\n2. Suggested answers highlighting my experience\n3. 3 technical questions I might face\n4. 3 good questions for me to ask the interviewer\n5. Tips for demonstrating my skills in {{skill}}")),
        ("projectPlan", PromptTemplate::new(Professional, "Project Plan",
            "Create a project plan outline for {{project}}. Include:\n\n1. Project scope and objectives\n2. Key deliverables and milestones\n3. Timeline with phases\n4. Resource requirements\n5. Potential risks and mitigation strategies\n6. Success metrics")),
        ("explainConcept", PromptTemplate::new(Learning, "Explain Concept",
            "Explain {{concept}} in a way that's easy to understand but comprehensive. Include:\n\n1. Simple definition and overview\n2. Historical context/development\n3. Real-world applications or examples\n4. Common misconceptions\n5. Advanced aspects for deeper understanding\n6. Resources for further learning")),
        ("studyGuide", PromptTemplate::new(Learning, "Study Guide",
            "Create a comprehensive study guide for {{subject}}. Include:\n\n1. Key concepts and definitions\n2. Important formulas or principles\n3. Example problems with step-by-step solutions\n4. Common misconceptions to avoid\n5. Practice questions with answers\n6. Memory aids and learning techniques")),
        ("researchSummary", PromptTemplate::new(Learning, "Research Summary",
            "Provide a detailed summary of current research on {{topic}} including:\n\n1. Key findings and breakthroughs\n2. Major researchers and their contributions\n3. Competing theories or approaches\n4. Practical applications\n5. Gaps in current knowledge\n6. Future research directions")),
        ("codeReview", PromptTemplate::new(Coding, "Code Review",
            "Review the following code for a {{language}} {{projectType}} application:\n\n```{{language}}\n{{code}}\n```\n\nPlease provide:\n1. Bugs or logical errors\n2. Security vulnerabilities\n3. Performance optimizations\n4. Readability improvements\n5. Best practices suggestions")),
        ("algorithmDesign", PromptTemplate::new(Coding, "Algorithm Design",
            "Design an efficient algorithm to solve this problem:\n\n{{problem}}\n\nPlease provide:\n1. A clear approach with pseudocode\n2. Time and space complexity analysis\n3. Edge cases and how to handle them\n4. Potential optimizations\n5. Implementation in {{language}} code")),
        ("systemArchitecture", PromptTemplate::new(Coding, "System Architecture",
            "Design a system architecture for {{application}} that needs to {{requirements}}.\n\nPlease include:\n1. High-level architecture diagram (described in text)\n2. Key components and their responsibilities\n3. Data flow between components\n4. Technology stack recommendations\n5. Scalability considerations\n6. Security measures")),
        ("weeklyPlanner", PromptTemplate::new(Personal, "Weekly Planner",
            "Help me create a weekly schedule to balance:\n\n1. Work commitments: {{workHours}}\n2. Personal project: {{personalProject}}\n3. Exercise routine: {{exerciseGoals}}\n4. Social activities\n5. Self-care and relaxation\n\nInclude specific time blocks, practical tips for staying on track, and strategies for maintaining work-life balance.")),
        ("decisionMatrix", PromptTemplate::new(Personal, "Decision Matrix",
            "Help me create a decision matrix for choosing between these options:\n\n{{options}}\n\nBased on these criteria:\n{{criteria}}\n\nProvide:\n1. A weighted scoring system\n2. Pros and cons analysis\n3. Consideration of both logical and emotional factors\n4. Short-term vs long-term implications\n5. A recommendation based on the analysis")),
        ("selfImprovement", PromptTemplate::new(Personal, "Self-Improvement",
            "Create a 30-day self-improvement plan to help me develop {{skill}} with:\n\n1. Clear, achievable daily actions\n2. Resources needed (books, courses, tools)\n3. Progress tracking method\n4. Potential obstacles and solutions\n5. Ways to maintain motivation\n6. How to measure success at the end")),
    ]
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TemplateExport<'a> {
    prompts: &'a BTreeMap<String, PromptTemplate>,
    version: &'static str,
    export_date: String,
}

/// Built-in templates plus user templates persisted under `user_prompts`.
pub struct TemplateStore {
    kv: Arc<dyn KvStore>,
    builtin: Vec<(&'static str, PromptTemplate)>,
    user: Mutex<BTreeMap<String, PromptTemplate>>,
}

impl TemplateStore {
    pub async fn load(kv: Arc<dyn KvStore>) -> Self {
        let user = match kv.get(USER_TEMPLATES_KEY).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse user templates: {e}");
                BTreeMap::new()
            }),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                tracing::warn!("Failed to load user templates: {e}");
                BTreeMap::new()
            }
        };
        Self {
            kv,
            builtin: builtin_templates(),
            user: Mutex::new(user),
        }
    }

    /// Built-ins first, then user templates by id.
    pub async fn all(&self) -> Vec<(String, PromptTemplate)> {
        let user = self.user.lock().await;
        self.builtin
            .iter()
            .map(|(id, t)| (id.to_string(), t.clone()))
            .chain(user.iter().map(|(id, t)| (id.clone(), t.clone())))
            .collect()
    }

    pub async fn by_category(&self, category: TemplateCategory) -> Vec<(String, PromptTemplate)> {
        self.all()
            .await
            .into_iter()
            .filter(|(_, t)| t.category == category)
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<PromptTemplate> {
        if let Some((_, t)) = self.builtin.iter().find(|(bid, _)| *bid == id) {
            return Some(t.clone());
        }
        self.user.lock().await.get(id).cloned()
    }

    pub fn is_user_template(id: &str) -> bool {
        id.starts_with("user_")
    }

    /// Save a new user template and return its `user_<millis>` id.
    pub async fn create(
        &self,
        title: &str,
        prompt: &str,
        category: TemplateCategory,
    ) -> Result<String, ChatError> {
        let (title, prompt) = (title.trim(), prompt.trim());
        if title.is_empty() || prompt.is_empty() {
            return Err(ChatError::EmptyPrompt);
        }

        let mut user = self.user.lock().await;
        let mut id = format!("user_{}", chrono::Utc::now().timestamp_millis());
        let mut n = 0;
        while user.contains_key(&id) {
            n += 1;
            id = format!("user_{}_{n}", chrono::Utc::now().timestamp_millis());
        }
        user.insert(id.clone(), PromptTemplate::new(category, title, prompt));
        self.persist(&user).await?;
        Ok(id)
    }

    /// Returns whether a user template was removed. Built-ins cannot be
    /// deleted.
    pub async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let mut user = self.user.lock().await;
        if user.remove(id).is_none() {
            return Ok(false);
        }
        self.persist(&user).await?;
        Ok(true)
    }

    /// Pretty JSON of the user templates, for sharing.
    pub async fn export(&self) -> Result<String, StorageError> {
        let user = self.user.lock().await;
        let export = TemplateExport {
            prompts: &user,
            version: "1.0",
            export_date: chrono::Utc::now().to_rfc3339(),
        };
        serde_json::to_string_pretty(&export).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Merge templates from an export document under fresh ids. Entries
    /// missing a title or prompt are skipped; unknown categories fall back
    /// to writing. Returns the number imported.
    pub async fn import(&self, json: &str) -> Result<usize, StorageError> {
        let data: serde_json::Value =
            serde_json::from_str(json).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let prompts = data["prompts"].as_object().ok_or_else(|| {
            StorageError::Serialization("Invalid import data: missing prompts object".into())
        })?;

        let millis = chrono::Utc::now().timestamp_millis();
        let mut user = self.user.lock().await;
        let mut count = 0;
        for entry in prompts.values() {
            let (Some(title), Some(prompt)) = (entry["title"].as_str(), entry["prompt"].as_str())
            else {
                continue;
            };
            if title.is_empty() || prompt.is_empty() {
                continue;
            }
            let category = entry["category"]
                .as_str()
                .and_then(TemplateCategory::parse)
                .unwrap_or(TemplateCategory::Writing);
            user.insert(
                format!("user_{millis}_{count}"),
                PromptTemplate::new(category, title, prompt),
            );
            count += 1;
        }
        self.persist(&user).await?;
        Ok(count)
    }

    async fn persist(&self, user: &BTreeMap<String, PromptTemplate>) -> Result<(), StorageError> {
        let json =
            serde_json::to_string(user).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.kv.set(USER_TEMPLATES_KEY, &json).await
    }
}
