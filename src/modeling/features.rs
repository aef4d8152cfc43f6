//! Attempt history to canonical feature vector.
//!
//! Each block is a pure function over already-fetched records so it can be
//! tested without a store. The builder only does the fetching; a failed fetch
//! degrades that block to its neutral value and is logged.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use super::vector::{Feature, FeatureVector};
use crate::config::FeatureParams;
use crate::db::{AttemptQuery, AttemptTotals, DataSources};
use crate::types::{ExerciseAttempt, GradeLevel, LearnerProfile, LearningStyle, SkillProficiency};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub const NEUTRAL_HOUR: f64 = 12.0;
pub const NEUTRAL_WEEKDAY: f64 = 3.0;
pub const NEUTRAL_SESSION_LENGTH: f64 = 1.0;
/// No reflection data source is wired in, so self-reported difficulty is fixed.
pub const SELF_REPORTED_DIFFICULTY: f64 = 0.5;
pub const NEUTRAL_STRATEGY_EFFECTIVENESS: f64 = 0.5;

/// How `prerequisite_mastery` is derived while no prerequisite graph exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrerequisiteProxy {
    /// Mean proficiency across every domain the learner has a record for.
    #[default]
    CrossDomainAverage,
}

impl PrerequisiteProxy {
    pub fn resolve(&self, skills: &SkillBlock) -> f64 {
        match self {
            Self::CrossDomainAverage => skills.cross_domain_avg,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RecentBlock {
    pub success_rate: f64,
    pub avg_time: f64,
    pub streak: u32,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrendBlock {
    pub trend_7d: f64,
    pub trend_30d: f64,
    pub learning_velocity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextBlock {
    pub hour_of_day: f64,
    pub day_of_week: f64,
    pub session_length: f64,
    pub fatigue_level: f64,
}

impl Default for ContextBlock {
    fn default() -> Self {
        Self {
            hour_of_day: NEUTRAL_HOUR,
            day_of_week: NEUTRAL_WEEKDAY,
            session_length: NEUTRAL_SESSION_LENGTH,
            fatigue_level: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SkillBlock {
    pub domain_proficiency: f64,
    pub cross_domain_avg: f64,
}

fn success_rate(attempts: &[ExerciseAttempt]) -> f64 {
    if attempts.is_empty() {
        return 0.0;
    }
    attempts.iter().filter(|a| a.is_correct).count() as f64 / attempts.len() as f64
}

/// `recent` is newest first.
pub fn recent_performance(recent: &[ExerciseAttempt]) -> RecentBlock {
    if recent.is_empty() {
        return RecentBlock::default();
    }

    let durations: Vec<f64> = recent.iter().filter_map(|a| a.recorded_duration()).collect();
    let avg_time = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };

    RecentBlock {
        success_rate: success_rate(recent),
        avg_time,
        streak: recent.iter().take_while(|a| a.is_correct).count() as u32,
        count: recent.len(),
    }
}

/// Rate over `[now - days, ..)` minus rate over `[now - 2*days, now - days)`.
/// Zero when either bucket is empty.
fn bucket_delta(domain: &[ExerciseAttempt], now: DateTime<Utc>, days: i64) -> f64 {
    let boundary = now - Duration::days(days);
    let floor = boundary - Duration::days(days);

    let (recent, previous): (Vec<&ExerciseAttempt>, Vec<&ExerciseAttempt>) = domain
        .iter()
        .filter(|a| a.timestamp >= floor)
        .partition(|a| a.timestamp >= boundary);

    if recent.is_empty() || previous.is_empty() {
        return 0.0;
    }
    let rate = |bucket: &[&ExerciseAttempt]| {
        bucket.iter().filter(|a| a.is_correct).count() as f64 / bucket.len() as f64
    };
    rate(&recent) - rate(&previous)
}

/// `domain` is newest first.
pub fn trends(domain: &[ExerciseAttempt], now: DateTime<Utc>, params: &FeatureParams) -> TrendBlock {
    if domain.len() < params.min_trend_attempts.max(2) {
        return TrendBlock::default();
    }

    let window = params.velocity_window.max(1).min(domain.len());
    let latest = &domain[..window];
    let earliest = &domain[domain.len() - window..];

    let (newest, oldest) = match (domain.first(), domain.last()) {
        (Some(newest), Some(oldest)) => (newest.timestamp, oldest.timestamp),
        _ => return TrendBlock::default(),
    };
    let elapsed_days = ((newest - oldest).num_days() + 1).max(1) as f64;

    TrendBlock {
        trend_7d: bucket_delta(domain, now, 7),
        trend_30d: bucket_delta(domain, now, 30),
        learning_velocity: (success_rate(latest) - success_rate(earliest)) / elapsed_days,
    }
}

/// Most frequent weekday, 0 = Monday. Ties go to the weekday seen first
/// walking from the most recent attempt.
fn modal_weekday(recent: &[ExerciseAttempt]) -> Option<u32> {
    let mut counts = [0usize; 7];
    let mut first_seen = [usize::MAX; 7];
    for (pos, attempt) in recent.iter().enumerate() {
        let day = attempt.timestamp.weekday().num_days_from_monday() as usize;
        counts[day] += 1;
        first_seen[day] = first_seen[day].min(pos);
    }

    (0..7)
        .filter(|day| counts[*day] > 0)
        .max_by(|a, b| {
            counts[*a]
                .cmp(&counts[*b])
                .then_with(|| first_seen[*b].cmp(&first_seen[*a]))
        })
        .map(|day| day as u32)
}

/// `recent` is newest first.
pub fn context(recent: &[ExerciseAttempt], params: &FeatureParams) -> ContextBlock {
    if recent.is_empty() {
        return ContextBlock::default();
    }

    let hour_of_day =
        recent.iter().map(|a| a.timestamp.hour() as f64).sum::<f64>() / recent.len() as f64;

    let gap = Duration::minutes(params.session_gap_minutes);
    let session_length = 1 + recent
        .windows(2)
        .take_while(|pair| pair[0].timestamp - pair[1].timestamp < gap)
        .count();

    let mut fatigue_level = 0.0;
    if recent.len() >= params.min_fatigue_attempts.max(2) {
        // newer half is the floor(len / 2) most recent; an odd extra stays older
        let (newer, older) = recent.split_at(recent.len() / 2);
        fatigue_level = (success_rate(older) - success_rate(newer)).clamp(0.0, 1.0);
    }

    ContextBlock {
        hour_of_day,
        day_of_week: modal_weekday(recent)
            .map(f64::from)
            .unwrap_or(NEUTRAL_WEEKDAY),
        session_length: session_length as f64,
        fatigue_level,
    }
}

pub fn skills(domain_record: Option<&SkillProficiency>, all: &[SkillProficiency]) -> SkillBlock {
    let cross_domain_avg = if all.is_empty() {
        0.0
    } else {
        all.iter().map(|p| p.proficiency).sum::<f64>() / all.len() as f64
    };

    SkillBlock {
        domain_proficiency: domain_record.map(|p| p.proficiency).unwrap_or(0.0),
        cross_domain_avg,
    }
}

/// Success rate on the most used strategy tag in the domain window. Ties
/// between tags go to the one seen first in the (newest first) window.
pub fn strategy_effectiveness(domain: &[ExerciseAttempt]) -> f64 {
    let mut tally: HashMap<&str, (usize, usize, usize)> = HashMap::new();
    for (pos, attempt) in domain.iter().enumerate() {
        if let Some(strategy) = attempt.strategy() {
            let entry = tally.entry(strategy).or_insert((0, 0, pos));
            entry.0 += 1;
            if attempt.is_correct {
                entry.1 += 1;
            }
        }
    }

    tally
        .values()
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.2.cmp(&a.2)))
        .map(|(used, correct, _)| *correct as f64 / *used as f64)
        .unwrap_or(NEUTRAL_STRATEGY_EFFECTIVENESS)
}

pub fn demographics(profile: Option<&LearnerProfile>) -> (f64, f64) {
    let grade = GradeLevel::encode_raw(profile.and_then(|p| p.grade_level.as_deref()));
    let style = LearningStyle::encode_raw(profile.and_then(|p| p.learning_style.as_deref()));
    (grade, style)
}

/// Assembles feature vectors from the configured data sources.
#[derive(Clone)]
pub struct FeatureVectorBuilder {
    sources: DataSources,
    params: FeatureParams,
    prerequisite_proxy: PrerequisiteProxy,
    clock: Clock,
}

impl FeatureVectorBuilder {
    pub fn new(sources: DataSources, params: FeatureParams) -> Self {
        Self {
            sources,
            params,
            prerequisite_proxy: PrerequisiteProxy::default(),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn sources(&self) -> &DataSources {
        &self.sources
    }

    pub fn params(&self) -> &FeatureParams {
        &self.params
    }

    pub async fn extract_features(&self, user_id: &str, skill_domain: &str) -> FeatureVector {
        self.extract_features_at(user_id, skill_domain, self.now()).await
    }

    pub async fn extract_features_at(
        &self,
        user_id: &str,
        skill_domain: &str,
        now: DateTime<Utc>,
    ) -> FeatureVector {
        let totals = match self.sources.attempts.totals(user_id).await {
            Ok(totals) => totals,
            Err(err) => {
                tracing::warn!(error = %err, user_id, "attempt totals unavailable");
                AttemptTotals::default()
            }
        };

        let recent = self
            .fetch_attempts(AttemptQuery::for_user(user_id).limit(self.params.recent_window))
            .await;

        if totals.total == 0 && recent.is_empty() {
            return FeatureVector::zeros();
        }

        let domain = self
            .fetch_attempts(
                AttemptQuery::for_user(user_id)
                    .domain(skill_domain)
                    .limit(self.params.domain_window),
            )
            .await;

        let domain_record = match self.sources.proficiency.get(user_id, skill_domain).await {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(error = %err, user_id, skill_domain, "domain proficiency unavailable");
                None
            }
        };
        let all_records = match self.sources.proficiency.list_for_user(user_id).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = %err, user_id, "proficiency records unavailable");
                Vec::new()
            }
        };
        let profile = match self.sources.profiles.get_profile(user_id).await {
            Ok(profile) => profile,
            Err(err) => {
                tracing::warn!(error = %err, user_id, "learner profile unavailable");
                None
            }
        };

        let recent_block = recent_performance(&recent);
        let trend_block = trends(&domain, now, &self.params);
        let context_block = context(&recent, &self.params);
        let skill_block = skills(domain_record.as_ref(), &all_records);
        let (grade, style) = demographics(profile.as_ref());

        let mut vector = FeatureVector::zeros();
        vector.set(Feature::RecentSuccessRate, recent_block.success_rate);
        vector.set(Feature::RecentAvgTime, recent_block.avg_time);
        vector.set(Feature::Streak, recent_block.streak as f64);
        vector.set(Feature::RecentExercisesCount, recent_block.count as f64);

        vector.set(Feature::Trend7d, trend_block.trend_7d);
        vector.set(Feature::Trend30d, trend_block.trend_30d);
        vector.set(Feature::LearningVelocity, trend_block.learning_velocity);

        vector.set(Feature::HourOfDay, context_block.hour_of_day);
        vector.set(Feature::DayOfWeek, context_block.day_of_week);
        vector.set(Feature::SessionLength, context_block.session_length);
        vector.set(Feature::FatigueLevel, context_block.fatigue_level);

        vector.set(
            Feature::PrerequisiteMastery,
            self.prerequisite_proxy.resolve(&skill_block),
        );
        vector.set(Feature::DomainProficiency, skill_block.domain_proficiency);
        vector.set(Feature::CrossDomainAvg, skill_block.cross_domain_avg);

        vector.set(Feature::SelfReportedDifficulty, SELF_REPORTED_DIFFICULTY);
        vector.set(Feature::StrategyEffectiveness, strategy_effectiveness(&domain));

        vector.set(Feature::GradeLevelEncoded, grade);
        vector.set(Feature::LearningStyleEncoded, style);

        vector.set(Feature::TotalExercises, totals.total as f64);
        vector.set(Feature::TotalCorrect, totals.correct as f64);
        vector.set(Feature::OverallSuccessRate, totals.success_rate());

        tracing::debug!(user_id, skill_domain, recent = recent.len(), domain = domain.len(), "features extracted");
        vector
    }

    async fn fetch_attempts(&self, query: AttemptQuery) -> Vec<ExerciseAttempt> {
        match self.sources.attempts.query(&query).await {
            Ok(attempts) => attempts,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    user_id = %query.user_id,
                    skill_domain = ?query.skill_domain,
                    "attempt history unavailable"
                );
                Vec::new()
            }
        }
    }
}
