use std::str::FromStr;

pub(crate) fn tag_name(tag: &[String]) -> Option<&str> {
    tag.first().map(String::as_str)
}

pub(crate) fn tag_field(tag: &[String], index: usize) -> Option<&str> {
    tag.get(index).map(String::as_str)
}

pub(crate) fn is_tag(tag: &[String], name: &str) -> bool {
    matches!(tag_name(tag), Some(tag_name) if tag_name == name)
}

pub(crate) fn find_tag_value<'a>(tags: &'a [Vec<String>], name: &str) -> Option<&'a str> {
    tags.iter()
        .filter(|tag| is_tag(tag, name))
        .find_map(|tag| tag_field(tag, 1))
}

/// Values (second field) of every tag called `name`, in tag order.
pub(crate) fn tag_values<'a>(
    tags: &'a [Vec<String>],
    name: &'a str,
) -> impl Iterator<Item = &'a str> + 'a {
    tags.iter()
        .filter(move |tag| is_tag(tag, name))
        .filter_map(|tag| tag_field(tag, 1))
}

pub(crate) fn collect_tag_values(tags: &[Vec<String>], name: &str) -> Vec<String> {
    tag_values(tags, name).map(str::to_owned).collect()
}

pub(crate) fn parse_tag_value<T>(tags: &[Vec<String>], name: &str) -> Option<T>
where
    T: FromStr,
{
    find_tag_value(tags, name).and_then(|value| value.parse::<T>().ok())
}
