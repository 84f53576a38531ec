pub(crate) mod feed;

pub(crate) use feed::FeedClient;
