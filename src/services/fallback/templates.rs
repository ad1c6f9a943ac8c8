//! 降级模式的话题模板与营养速查

use crate::models::agent::{Tone, Topic};

pub struct TopicTemplate {
    pub summary: &'static str,
    pub reply: &'static str,
    pub diet: &'static [&'static str],
    pub exercise: &'static [&'static str],
    pub hydration: &'static [&'static str],
    pub recovery: &'static [&'static str],
    pub follow_up: &'static str,
    pub tone: Tone,
    pub nutrition: &'static [&'static str],
}

const FATIGUE: TopicTemplate = TopicTemplate {
    summary: "Signs of low energy and fatigue.",
    reply: "It sounds like today has really drained you, and that's worth taking seriously.",
    diet: &["Have a balanced snack with protein and slow carbs, like oats with nuts or yogurt with fruit"],
    exercise: &["Take a gentle 10-minute walk outside to lift alertness without adding strain"],
    hydration: &["Drink a large glass of water now; mild dehydration feels a lot like fatigue"],
    recovery: &["Aim for a consistent bedtime tonight and keep screens away for the last 30 minutes"],
    follow_up: "How has your sleep been over the last few nights?",
    tone: Tone::Supportive,
    nutrition: &["Oats: slow-release carbs that keep energy steady", "Bananas: quick potassium and carbs"],
};

const STRESS: TopicTemplate = TopicTemplate {
    summary: "Elevated stress is weighing on the user.",
    reply: "That sounds like a lot to carry right now.",
    diet: &["Choose magnesium-rich foods such as spinach, almonds or pumpkin seeds"],
    exercise: &["Try five minutes of slow breathing: in for 4, hold for 4, out for 6"],
    hydration: &["Swap the next coffee for water or a caffeine-free herbal tea"],
    recovery: &["Block a 15-minute break today with no notifications"],
    follow_up: "What's the biggest source of pressure for you at the moment?",
    tone: Tone::Calm,
    nutrition: &["Almonds: magnesium supports relaxation", "Spinach: magnesium and folate"],
};

const PAIN: TopicTemplate = TopicTemplate {
    summary: "The user reports physical pain or soreness.",
    reply: "I'm sorry you're hurting.",
    diet: &["Include anti-inflammatory foods like salmon, berries or leafy greens"],
    exercise: &["Keep movement gentle and stop anything that sharpens the pain"],
    hydration: &["Keep sipping water through the day to support recovery"],
    recovery: &["Rest the area and check with a clinician if the pain is severe or persists"],
    follow_up: "Where is the pain, and has it changed since it started?",
    tone: Tone::Cautious,
    nutrition: &["Salmon: omega-3 fats", "Blueberries: antioxidants"],
};

const HEADACHE: TopicTemplate = TopicTemplate {
    summary: "The user has a headache.",
    reply: "Headaches can really take the wind out of a day.",
    diet: &["Eat something regular and balanced; skipped meals often trigger headaches"],
    exercise: &["Step away from screens and loosen your neck and shoulders for a few minutes"],
    hydration: &["Drink two glasses of water over the next hour"],
    recovery: &["Rest in a dim, quiet room if you can"],
    follow_up: "Did you drink enough water and eat regularly today?",
    tone: Tone::Calm,
    nutrition: &["Water: dehydration is a common headache trigger"],
};

const SLEEP: TopicTemplate = TopicTemplate {
    summary: "Sleep quality or duration is a concern.",
    reply: "Poor sleep affects everything, so it makes sense you're feeling it.",
    diet: &["Avoid caffeine after 2 pm and keep dinner light"],
    exercise: &["Get 10 minutes of daylight and light movement early in the day"],
    hydration: &["Front-load water earlier so you're not up at night"],
    recovery: &["Keep the same wake-up time every day, even after a rough night"],
    follow_up: "What time did you go to bed and wake up last night?",
    tone: Tone::Supportive,
    nutrition: &["Walnuts: natural melatonin", "Milk: tryptophan and calcium"],
};

const NUTRITION: TopicTemplate = TopicTemplate {
    summary: "The user is asking about food and nutrition.",
    reply: "Good question about food.",
    diet: &["Build your next meal around a palm of protein, a fist of carbs and half a plate of vegetables"],
    exercise: &["A short walk after eating helps steady blood sugar"],
    hydration: &["Keep a water bottle with you and refill it with each meal"],
    recovery: &["Plan tomorrow's breakfast tonight so it's easy to get right"],
    follow_up: "What does a typical day of eating look like for you?",
    tone: Tone::Encouraging,
    nutrition: &["Lentils: iron, folate and fiber", "Eggs: complete protein"],
};

const EXERCISE: TopicTemplate = TopicTemplate {
    summary: "The user is focused on exercise and activity.",
    reply: "Love that you're thinking about movement.",
    diet: &["Refuel within an hour of training with protein and carbs"],
    exercise: &["Start with 20 minutes at a pace where you can still hold a conversation"],
    hydration: &["Drink water before and after your session"],
    recovery: &["Stretch for 5 minutes afterwards and leave a rest day this week"],
    follow_up: "What kind of movement do you enjoy most?",
    tone: Tone::Encouraging,
    nutrition: &["Chicken breast: lean protein", "Sweet potato: complex carbs"],
};

const MOTIVATION: TopicTemplate = TopicTemplate {
    summary: "The user is struggling with motivation.",
    reply: "Motivation comes and goes for everyone, so you're not alone in this.",
    diet: &["Prepare one easy, healthy snack ahead of time to remove friction"],
    exercise: &["Commit to just five minutes of movement; starting is the hardest part"],
    hydration: &["Start the day with a glass of water as a small first win"],
    recovery: &["Write down one thing you did well today"],
    follow_up: "What's one small goal you'd like to hit this week?",
    tone: Tone::Encouraging,
    nutrition: &["Blueberries: an easy, healthy grab-and-go snack"],
};

const POSITIVE: TopicTemplate = TopicTemplate {
    summary: "The user is feeling good.",
    reply: "That's great to hear!",
    diet: &["Keep fueling with the meals that are working for you"],
    exercise: &["Use the good energy for a slightly longer walk or workout"],
    hydration: &["Keep up your water intake to hold onto that energy"],
    recovery: &["Protect tonight's sleep so tomorrow feels just as good"],
    follow_up: "What do you think helped you feel this way?",
    tone: Tone::Celebratory,
    nutrition: &["Greek yogurt: protein and probiotics"],
};

const GENERAL: TopicTemplate = TopicTemplate {
    summary: "General wellness check-in.",
    reply: "Thanks for checking in.",
    diet: &["Include a source of protein and some vegetables in your next meal"],
    exercise: &["Fit in a 10-minute walk today"],
    hydration: &["Aim for a glass of water with every meal"],
    recovery: &["Keep a steady bedtime tonight"],
    follow_up: "How is your energy today on a scale from 1 to 10?",
    tone: Tone::Warm,
    nutrition: &["Water: hydration supports energy and focus"],
};

pub fn template(topic: Topic) -> &'static TopicTemplate {
    match topic {
        Topic::Fatigue => &FATIGUE,
        Topic::Stress => &STRESS,
        Topic::Pain => &PAIN,
        Topic::Headache => &HEADACHE,
        Topic::Sleep => &SLEEP,
        Topic::Nutrition => &NUTRITION,
        Topic::Exercise => &EXERCISE,
        Topic::Motivation => &MOTIVATION,
        Topic::Positive => &POSITIVE,
        Topic::General => &GENERAL,
    }
}

/// 话题关键词
pub fn keywords(topic: Topic) -> &'static str {
    match topic {
        Topic::Fatigue => r"(?i)\b(tired|exhausted|fatigue\w*|drained|sleepy|no energy|low energy|wiped out|worn out|lethargic)\b",
        Topic::Stress => r"(?i)\b(stress\w*|anxious|anxiety|overwhelm\w*|pressure|worried|tense|panic\w*)\b",
        Topic::Pain => r"(?i)\b(pain\w*|sore|ache|aching|hurts?|injur\w*|cramps?)\b",
        Topic::Headache => r"(?i)\b(headaches?|migraines?|head hurts)\b",
        Topic::Sleep => r"(?i)\b(sleep\w*|slept|insomnia|nap|bedtime|woke up|awake)\b",
        Topic::Nutrition => r"(?i)\b(eat\w*|food|meal\w*|diet|breakfast|lunch|dinner|snack\w*|protein|nutrition|calorie\w*|hungry)\b",
        Topic::Exercise => r"(?i)\b(exercise\w*|workout\w*|gym|run(ning)?|walk\w*|training|steps|cardio|yoga|stretch\w*)\b",
        Topic::Motivation => r"(?i)\b(motivat\w*|lazy|procrastinat\w*|can'?t get started|give up|discipline|stuck)\b",
        Topic::Positive => r"(?i)\b(great|good|amazing|awesome|energi[sz]ed|fantastic|happy|better|wonderful|excellent)\b",
        Topic::General => r"$^",
    }
}
